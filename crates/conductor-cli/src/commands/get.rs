//! Path queries.

use anyhow::Result;
use conductor_data::{Filter, Resolved, ResultSpec};

use super::Session;

pub fn result_spec(
    filters: &[String],
    order: Vec<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    properties: Vec<String>,
) -> Result<ResultSpec> {
    let filters = filters
        .iter()
        .map(|f| f.parse::<Filter>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResultSpec {
        filters,
        order,
        limit,
        offset,
        properties,
    })
}

pub async fn get(session: &Session, path: &str, spec: &ResultSpec) -> Result<()> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match session.data.get(&segments, spec).await? {
        Resolved::None => println!("null"),
        Resolved::One(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Resolved::Many(values) => println!("{}", serde_json::to_string_pretty(&values)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_data::FilterOp;
    use serde_json::json;

    #[test]
    fn test_result_spec() {
        let spec = result_spec(
            &["complete=false".to_string(), "results__ge=2".to_string()],
            vec!["-submitted_at".to_string()],
            Some(10),
            None,
            vec!["*".to_string()],
        )
        .unwrap();
        assert_eq!(spec.filters.len(), 2);
        assert_eq!(spec.filters[0], Filter::equals("complete", json!(false)));
        assert_eq!(spec.filters[1].op, FilterOp::Ge);
        assert_eq!(spec.limit, Some(10));
        assert_eq!(spec.properties, vec!["*"]);
    }

    #[test]
    fn test_result_spec_rejects_bad_filter() {
        assert!(result_spec(&["results__near=2".to_string()], vec![], None, None, vec![]).is_err());
    }
}
