//! Path routing for the query layer.

use conductor_core::{BuildId, BuildRequestId, BuildsetId, StepId};

use crate::{DataError, DataResult};

/// A path segment that names an entity either by number or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Id(i64),
    Name(String),
}

impl Identifier {
    pub fn parse(segment: &str) -> Self {
        match segment.parse::<i64>() {
            Ok(id) => Identifier::Id(id),
            Err(_) => Identifier::Name(segment.to_string()),
        }
    }
}

/// A build addressed by id or by builder and number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildRef {
    Id(BuildId),
    Number { builder: Identifier, number: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    BuildRequests { builder: Option<Identifier> },
    BuildRequest(BuildRequestId),
    BuildRequestBuilds(BuildRequestId),
    Buildsets,
    Buildset(BuildsetId),
    BuildsetProperties(BuildsetId),
    Builds { builder: Option<Identifier> },
    Build(BuildRef),
    Steps(BuildRef),
    Step(StepId),
    BuildStep { build: BuildRef, step: Identifier },
}

fn integer<T: From<i64>>(path: &[&str], segment: &str) -> DataResult<T> {
    segment
        .parse::<i64>()
        .map(T::from)
        .map_err(|_| invalid(path))
}

fn number(path: &[&str], segment: &str) -> DataResult<i32> {
    segment.parse::<i32>().map_err(|_| invalid(path))
}

fn invalid(path: &[&str]) -> DataError {
    DataError::InvalidPath(path.join("/"))
}

impl Route {
    pub fn parse(path: &[&str]) -> DataResult<Route> {
        let route = match *path {
            ["buildrequests"] => Route::BuildRequests { builder: None },
            ["buildrequests", id] => Route::BuildRequest(integer(path, id)?),
            ["buildrequests", id, "builds"] => Route::BuildRequestBuilds(integer(path, id)?),
            ["builders", builder, "buildrequests"] => Route::BuildRequests {
                builder: Some(Identifier::parse(builder)),
            },
            ["buildsets"] => Route::Buildsets,
            ["buildsets", id] => Route::Buildset(integer(path, id)?),
            ["buildsets", id, "properties"] => Route::BuildsetProperties(integer(path, id)?),
            ["builds"] => Route::Builds { builder: None },
            ["builds", id] => Route::Build(BuildRef::Id(integer(path, id)?)),
            ["builders", builder, "builds"] => Route::Builds {
                builder: Some(Identifier::parse(builder)),
            },
            ["builders", builder, "builds", n] => Route::Build(BuildRef::Number {
                builder: Identifier::parse(builder),
                number: number(path, n)?,
            }),
            ["steps", id] => Route::Step(integer(path, id)?),
            ["builds", id, "steps"] => Route::Steps(BuildRef::Id(integer(path, id)?)),
            ["builds", id, "steps", step] => Route::BuildStep {
                build: BuildRef::Id(integer(path, id)?),
                step: Identifier::parse(step),
            },
            ["builders", builder, "builds", n, "steps"] => Route::Steps(BuildRef::Number {
                builder: Identifier::parse(builder),
                number: number(path, n)?,
            }),
            ["builders", builder, "builds", n, "steps", step] => Route::BuildStep {
                build: BuildRef::Number {
                    builder: Identifier::parse(builder),
                    number: number(path, n)?,
                },
                step: Identifier::parse(step),
            },
            _ => return Err(invalid(path)),
        };
        Ok(route)
    }
}
