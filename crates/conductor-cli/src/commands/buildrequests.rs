//! Build request lifecycle commands.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use conductor_core::{BuildRequestId, Results};

use super::{Session, timestamp};

pub async fn claim(session: &Session, ids: &[BuildRequestId], at: Option<i64>) -> Result<()> {
    if session.data.buildrequests().claim(ids, timestamp(at)?).await? {
        println!("Claimed {} build request(s)", ids.len());
        Ok(())
    } else {
        bail!("Build requests already claimed by another master");
    }
}

pub async fn unclaim(session: &Session, ids: &[BuildRequestId]) -> Result<()> {
    session.data.buildrequests().unclaim(ids).await?;
    println!("Unclaimed {} build request(s)", ids.len());
    Ok(())
}

pub async fn complete(
    session: &Session,
    ids: &[BuildRequestId],
    results: Results,
    at: Option<i64>,
) -> Result<()> {
    let data = &session.data;
    if !data
        .buildrequests()
        .complete(ids, results, timestamp(at)?)
        .await?
    {
        bail!("Build requests are not claimed by this master or already complete");
    }
    println!("Completed {} build request(s) with results {}", ids.len(), results);

    let mut buildsets = Vec::new();
    for id in ids {
        if let Some(view) = data.buildrequests().get(*id).await? {
            if !buildsets.contains(&view.buildsetid) {
                buildsets.push(view.buildsetid);
            }
        }
    }
    for bsid in buildsets {
        if data.buildsets().maybe_complete(bsid).await? {
            println!("Buildset {} complete", bsid);
        }
    }
    Ok(())
}

pub async fn reclaim(session: &Session, ids: &[BuildRequestId], at: Option<i64>) -> Result<()> {
    if session.data.buildrequests().reclaim(ids, timestamp(at)?).await? {
        println!("Reclaimed {} build request(s)", ids.len());
        Ok(())
    } else {
        bail!("Build requests are not all held by this master");
    }
}

pub async fn unclaim_expired(session: &Session, expiry: Duration) -> Result<()> {
    let expiry = chrono::Duration::from_std(expiry).context("Expiry is out of range")?;
    let released = session.data.buildrequests().unclaim_expired(expiry).await?;
    if released.is_empty() {
        println!("No expired claims");
    }
    for id in released {
        println!("Released {}", id);
    }
    Ok(())
}

pub async fn rebuild(session: &Session, id: BuildRequestId) -> Result<()> {
    let data = &session.data;
    let buildrequest = data
        .buildrequests()
        .get(id)
        .await?
        .with_context(|| format!("Build request {} not found", id))?;
    let (bsid, brids) = data.buildrequests().rebuild(&buildrequest).await?;
    println!("Buildset {}", bsid);
    for (builderid, brid) in brids {
        println!("  builder {} -> build request {}", builderid, brid);
    }
    Ok(())
}
