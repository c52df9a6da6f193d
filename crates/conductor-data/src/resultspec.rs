//! Result specifications: filtering, ordering and paging of query results.
//!
//! Some filters are consumed by the store query itself (`pop_*`); whatever is
//! left is applied to the fetched views by [`ResultSpec::apply`].

use std::cmp::Ordering;
use std::str::FromStr;

use serde_json::Value;

use crate::DataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

impl FromStr for FilterOp {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(FilterOp::Eq),
            "ne" => Ok(FilterOp::Ne),
            "lt" => Ok(FilterOp::Lt),
            "le" => Ok(FilterOp::Le),
            "gt" => Ok(FilterOp::Gt),
            "ge" => Ok(FilterOp::Ge),
            "contains" => Ok(FilterOp::Contains),
            other => Err(DataError::InvalidSpec(format!("unknown filter op '{}'", other))),
        }
    }
}

/// A condition on one field of a view.
///
/// `eq` matches any of `values`, `ne` matches none of them; the ordering
/// operators compare against the first value.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub values: Vec<Value>,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            values,
        }
    }

    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Eq, vec![value])
    }

    pub fn matches(&self, item: &Value) -> bool {
        let null = Value::Null;
        let actual = item.get(&self.field).unwrap_or(&null);
        let is = |v: &Value, want: Ordering| compare(actual, v) == Some(want);
        match self.op {
            FilterOp::Eq => self.values.iter().any(|v| is(v, Ordering::Equal)),
            FilterOp::Ne => !self.values.iter().any(|v| is(v, Ordering::Equal)),
            FilterOp::Lt => self.values.first().is_some_and(|v| is(v, Ordering::Less)),
            FilterOp::Gt => self.values.first().is_some_and(|v| is(v, Ordering::Greater)),
            FilterOp::Le => self.values.first().is_some_and(|v| {
                matches!(compare(actual, v), Some(Ordering::Less | Ordering::Equal))
            }),
            FilterOp::Ge => self.values.first().is_some_and(|v| {
                matches!(compare(actual, v), Some(Ordering::Greater | Ordering::Equal))
            }),
            FilterOp::Contains => self.values.iter().any(|v| contains(actual, v)),
        }
    }

    /// The single value of an `eq` filter.
    fn single_eq(&self) -> Option<&Value> {
        match (self.op, self.values.as_slice()) {
            (FilterOp::Eq, [value]) => Some(value),
            _ => None,
        }
    }
}

/// Parses `field=value` or `field__op=value`. The value is read as JSON when
/// it parses (`true`, `42`, `null`) and as a plain string otherwise.
impl FromStr for Filter {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, raw) = s
            .split_once('=')
            .ok_or_else(|| DataError::InvalidSpec(format!("filter '{}' has no '='", s)))?;
        let (field, op) = match key.split_once("__") {
            Some((field, op)) => (field, op.parse()?),
            None => (key, FilterOp::Eq),
        };
        if field.is_empty() {
            return Err(DataError::InvalidSpec(format!("filter '{}' has no field", s)));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Filter::new(field, op, vec![value]))
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), _) => items
            .iter()
            .any(|item| compare(item, needle) == Some(Ordering::Equal)),
        _ => false,
    }
}

/// Filters, ordering, paging and property selection for a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSpec {
    pub filters: Vec<Filter>,
    /// Field names, `-` prefixed for descending.
    pub order: Vec<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Property names to attach, `*` for all. Empty attaches none.
    pub properties: Vec<String>,
}

impl ResultSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order(mut self, field: impl Into<String>) -> Self {
        self.order.push(field.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    /// Remove and return the first single-valued `eq` filter on `field` whose
    /// value `convert` accepts.
    fn pop_eq<T>(&mut self, field: &str, convert: impl Fn(&Value) -> Option<T>) -> Option<T> {
        let index = self
            .filters
            .iter()
            .position(|f| f.field == field && f.single_eq().and_then(&convert).is_some())?;
        let filter = self.filters.remove(index);
        filter.single_eq().and_then(convert)
    }

    pub fn pop_boolean_filter(&mut self, field: &str) -> Option<bool> {
        self.pop_eq(field, Value::as_bool)
    }

    pub fn pop_integer_filter(&mut self, field: &str) -> Option<i64> {
        self.pop_eq(field, Value::as_i64)
    }

    pub fn pop_string_filter(&mut self, field: &str) -> Option<String> {
        self.pop_eq(field, |v| v.as_str().map(String::from))
    }

    /// Apply the remaining filters, then ordering, offset and limit.
    pub fn apply(&self, items: Vec<Value>) -> Vec<Value> {
        let mut items: Vec<Value> = items
            .into_iter()
            .filter(|item| self.filters.iter().all(|f| f.matches(item)))
            .collect();

        if !self.order.is_empty() {
            items.sort_by(|a, b| {
                for key in &self.order {
                    let (field, descending) = match key.strip_prefix('-') {
                        Some(field) => (field, true),
                        None => (key.as_str(), false),
                    };
                    let null = Value::Null;
                    let ordering = compare(
                        a.get(field).unwrap_or(&null),
                        b.get(field).unwrap_or(&null),
                    )
                    .unwrap_or(Ordering::Equal);
                    let ordering = if descending {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        items
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Value> {
        vec![
            json!({"id": 1, "results": -1, "name": "compile", "complete": false}),
            json!({"id": 2, "results": 2, "name": "test", "complete": true}),
            json!({"id": 3, "results": 0, "name": "upload", "complete": true}),
        ]
    }

    fn ids(items: &[Value]) -> Vec<i64> {
        items.iter().filter_map(|v| v["id"].as_i64()).collect()
    }

    #[test]
    fn test_parse_filter() {
        let f: Filter = "complete=false".parse().unwrap();
        assert_eq!(f, Filter::equals("complete", json!(false)));

        let f: Filter = "results__gt=1".parse().unwrap();
        assert_eq!(f.op, FilterOp::Gt);
        assert_eq!(f.values, vec![json!(1)]);

        let f: Filter = "name__contains=pil".parse().unwrap();
        assert_eq!(f.values, vec![json!("pil")]);

        assert!("results__between=1".parse::<Filter>().is_err());
        assert!("novalue".parse::<Filter>().is_err());
        assert!("=1".parse::<Filter>().is_err());
    }

    #[test]
    fn test_apply_filters() {
        let spec = ResultSpec::new().with_filter("complete=true".parse().unwrap());
        assert_eq!(ids(&spec.apply(rows())), vec![2, 3]);

        let spec = ResultSpec::new().with_filter("results__ge=0".parse().unwrap());
        assert_eq!(ids(&spec.apply(rows())), vec![2, 3]);

        let spec = ResultSpec::new().with_filter("name__contains=o".parse().unwrap());
        assert_eq!(ids(&spec.apply(rows())), vec![1, 3]);

        let spec = ResultSpec::new().with_filter(Filter::new(
            "id",
            FilterOp::Ne,
            vec![json!(1), json!(3)],
        ));
        assert_eq!(ids(&spec.apply(rows())), vec![2]);
    }

    #[test]
    fn test_order_and_limit() {
        let spec = ResultSpec::new().with_order("results").with_limit(2);
        let got = spec.apply(rows());
        assert_eq!(got.len(), 2);
        assert_eq!(got[0]["results"], -1);

        let spec = ResultSpec::new().with_order("-results").with_limit(2);
        let got = spec.apply(rows());
        assert_eq!(got[0]["results"], 2);

        let spec = ResultSpec::new().with_order("id").with_offset(1);
        assert_eq!(ids(&spec.apply(rows())), vec![2, 3]);
    }

    #[test]
    fn test_pop_filters() {
        let mut spec = ResultSpec::new()
            .with_filter("complete=false".parse().unwrap())
            .with_filter("buildsetid=55".parse().unwrap())
            .with_filter("branch=mybranch".parse().unwrap());

        assert_eq!(spec.pop_boolean_filter("complete"), Some(false));
        assert_eq!(spec.pop_integer_filter("buildsetid"), Some(55));
        assert_eq!(spec.pop_boolean_filter("claimed"), None);
        assert_eq!(spec.filters, vec![Filter::equals("branch", json!("mybranch"))]);

        assert_eq!(spec.pop_string_filter("branch"), Some("mybranch".to_string()));
        assert!(spec.filters.is_empty());
    }

    #[test]
    fn test_pop_leaves_non_eq_filters() {
        let mut spec = ResultSpec::new().with_filter("buildsetid__gt=5".parse().unwrap());
        assert_eq!(spec.pop_integer_filter("buildsetid"), None);
        assert_eq!(spec.filters.len(), 1);
    }
}
