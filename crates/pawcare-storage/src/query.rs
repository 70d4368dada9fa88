//! Backend-neutral query descriptor.
//!
//! A [`Query`] is built with chained calls in the same shape the hosted
//! backend's client library uses, then rendered by each backend.

use std::cmp::Ordering;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
    pub nulls_last: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq { column: String, value: Value },
    /// Case-insensitive substring match.
    ILike { column: String, needle: String },
    Gte { column: String, value: Value },
    Lte { column: String, value: Value },
    /// Array column holds every listed value.
    Contains { column: String, values: Vec<String> },
    /// Array column holds at least one listed value.
    Overlaps { column: String, values: Vec<String> },
    NotNull { column: String },
    /// Array column is present and has at least one element.
    NotEmpty { column: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    columns: String,
    predicates: Vec<Predicate>,
    order: Vec<Order>,
    limit: Option<usize>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            predicates: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Predicate::Eq {
            column: column.into(),
            value: value.into(),
        })
    }

    pub fn ilike(self, column: impl Into<String>, needle: impl Into<String>) -> Self {
        self.filter(Predicate::ILike {
            column: column.into(),
            needle: needle.into(),
        })
    }

    pub fn gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Predicate::Gte {
            column: column.into(),
            value: value.into(),
        })
    }

    pub fn lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Predicate::Lte {
            column: column.into(),
            value: value.into(),
        })
    }

    pub fn contains<I, S>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter(Predicate::Contains {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn overlaps<I, S>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter(Predicate::Overlaps {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn not_null(self, column: impl Into<String>) -> Self {
        self.filter(Predicate::NotNull {
            column: column.into(),
        })
    }

    pub fn not_empty(self, column: impl Into<String>) -> Self {
        self.filter(Predicate::NotEmpty {
            column: column.into(),
        })
    }

    /// Orders with Postgres null placement: last when ascending, first when descending.
    pub fn order(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            column: column.into(),
            direction,
            nulls_last: direction == Direction::Asc,
        });
        self
    }

    pub fn order_nulls_last(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            column: column.into(),
            direction,
            nulls_last: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &str {
        &self.columns
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn ordering(&self) -> &[Order] {
        &self.order
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Column list, or `None` for `*`.
    pub fn column_list(&self) -> Option<Vec<&str>> {
        let columns = self.columns.trim();
        if columns.is_empty() || columns == "*" {
            return None;
        }
        Some(
            columns
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect(),
        )
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }

    pub fn compare_rows(&self, a: &Value, b: &Value) -> Ordering {
        for order in &self.order {
            let ord = order.compare(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Filter-only PostgREST parameters, used for update and delete.
    pub fn postgrest_filter_params(&self) -> Vec<(String, String)> {
        self.predicates
            .iter()
            .map(Predicate::postgrest_param)
            .collect()
    }

    pub fn postgrest_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.columns.clone())];
        params.extend(self.postgrest_filter_params());
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(Order::postgrest_fragment)
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_string(), order));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

impl Predicate {
    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq { column, .. }
            | Predicate::ILike { column, .. }
            | Predicate::Gte { column, .. }
            | Predicate::Lte { column, .. }
            | Predicate::Contains { column, .. }
            | Predicate::Overlaps { column, .. }
            | Predicate::NotNull { column }
            | Predicate::NotEmpty { column } => column,
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Predicate::Eq { value, .. } => values_equal(field, value),
            Predicate::ILike { needle, .. } => field
                .as_str()
                .is_some_and(|s| s.to_lowercase().contains(&needle.to_lowercase())),
            Predicate::Gte { value, .. } => {
                compare_values(field, value).is_some_and(|o| o != Ordering::Less)
            }
            Predicate::Lte { value, .. } => {
                compare_values(field, value).is_some_and(|o| o != Ordering::Greater)
            }
            Predicate::Contains { values, .. } => {
                let held = string_items(field);
                held.is_some_and(|held| values.iter().all(|v| held.contains(&v.as_str())))
            }
            Predicate::Overlaps { values, .. } => {
                let held = string_items(field);
                held.is_some_and(|held| values.iter().any(|v| held.contains(&v.as_str())))
            }
            Predicate::NotNull { .. } => !field.is_null(),
            Predicate::NotEmpty { .. } => field.as_array().is_some_and(|a| !a.is_empty()),
        }
    }

    fn postgrest_param(&self) -> (String, String) {
        let value = match self {
            Predicate::Eq { value, .. } => format!("eq.{}", scalar_text(value)),
            Predicate::ILike { needle, .. } => format!("ilike.*{}*", escape_like(needle)),
            Predicate::Gte { value, .. } => format!("gte.{}", scalar_text(value)),
            Predicate::Lte { value, .. } => format!("lte.{}", scalar_text(value)),
            Predicate::Contains { values, .. } => format!("cs.{}", array_literal(values)),
            Predicate::Overlaps { values, .. } => format!("ov.{}", array_literal(values)),
            Predicate::NotNull { .. } => "not.is.null".to_string(),
            Predicate::NotEmpty { .. } => "not.eq.{}".to_string(),
        };
        (self.column().to_string(), value)
    }
}

impl Order {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let av = a.get(&self.column).unwrap_or(&Value::Null);
        let bv = b.get(&self.column).unwrap_or(&Value::Null);
        match (av.is_null(), bv.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if self.nulls_last => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, true) if self.nulls_last => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => {
                let ord = compare_values(av, bv).unwrap_or(Ordering::Equal);
                match self.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            }
        }
    }

    fn postgrest_fragment(&self) -> String {
        let direction = match self.direction {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        };
        let nulls = if self.nulls_last { "nullslast" } else { "nullsfirst" };
        format!("{}.{}.{}", self.column, direction, nulls)
    }
}

/// Escapes `LIKE` metacharacters so the needle matches literally.
pub fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn array_literal(values: &[String]) -> String {
    let items = values
        .iter()
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{items}}}")
}

fn string_items(value: &Value) -> Option<Vec<&str>> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_str).collect())
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => a == b,
    }
}

// SQL comparison: anything against null is unknown.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
