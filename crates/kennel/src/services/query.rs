use super::schema::RecordSchema;
use super::types::{format_timestamp, Filter, PageLimits};
use super::DataError;
use crate::db::{QueryParameter, QuerySpec, QueryWindow};

/// Field every search is ordered by, newest first
pub const ORDER_FIELD: &str = "createdAt";

/// A parameterized query ready to run, plus the page window it selects
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub spec: QuerySpec,
    pub limit: u32,
    pub offset: u32,
}

impl CompiledQuery {
    pub fn text(&self) -> &str {
        &self.spec.query
    }

    pub fn parameters(&self) -> &[QueryParameter] {
        &self.spec.parameters
    }

    /// Ordering and page to merge partition results with
    pub fn window(&self) -> QueryWindow {
        QueryWindow {
            order_by: ORDER_FIELD,
            descending: true,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

/// Compiles a [`Filter`] into query text with bound parameters.
///
/// Field names in the text come from the schema only. Every caller-supplied
/// value is bound as a named parameter.
pub struct QueryCompiler<'a> {
    schema: &'a RecordSchema,
    limits: PageLimits,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(schema: &'a RecordSchema, limits: PageLimits) -> Self {
        Self { schema, limits }
    }

    pub fn compile(&self, filter: &Filter) -> Result<CompiledQuery, DataError> {
        let limit = self.limit(filter.limit)?;
        let mut predicates = Vec::new();
        let mut spec = QuerySpec::new("");

        if let Some(term) = filter.term() {
            if self.schema.search_fields.is_empty() {
                return Err(DataError::Validation(format!(
                    "{} does not support text search",
                    self.schema.name
                )));
            }
            let matches: Vec<String> = self
                .schema
                .search_fields
                .iter()
                .map(|field| format!("CONTAINS(c.{}, @term)", field))
                .collect();
            predicates.push(format!("({})", matches.join(" OR ")));
            spec = spec.with_parameter("@term", term);
        }

        for (field, value) in &filter.categories {
            let value = self.schema.validate_filter(field, value)?;
            let name = self.schema.field(field).map(|spec| spec.name).ok_or_else(|| {
                DataError::Validation(format!("unknown field '{}'", field))
            })?;
            predicates.push(format!("c.{} = @{}", name, name));
            spec = spec.with_parameter(format!("@{}", name), value);
        }

        if filter.low_stock_only == Some(true) {
            let flag = self.schema.low_stock.ok_or_else(|| {
                DataError::Validation(format!(
                    "{} does not support low stock filtering",
                    self.schema.name
                ))
            })?;
            predicates.push(format!("c.{} < @lowStockThreshold", flag.field));
            spec = spec.with_parameter("@lowStockThreshold", flag.threshold);
        }

        if filter.from.is_some() || filter.to.is_some() {
            let field = self.schema.range_field.ok_or_else(|| {
                DataError::Validation(format!(
                    "{} does not support time range filtering",
                    self.schema.name
                ))
            })?;
            if let (Some(from), Some(to)) = (filter.from, filter.to) {
                if from > to {
                    return Err(DataError::Validation(
                        "range start must not be after range end".to_string(),
                    ));
                }
            }
            if let Some(from) = filter.from {
                predicates.push(format!("c.{} >= @from", field));
                spec = spec.with_parameter("@from", format_timestamp(&from));
            }
            if let Some(to) = filter.to {
                predicates.push(format!("c.{} <= @to", field));
                spec = spec.with_parameter("@to", format_timestamp(&to));
            }
        }

        let mut text = String::from("SELECT * FROM c");
        if !predicates.is_empty() {
            text.push_str(" WHERE ");
            text.push_str(&predicates.join(" AND "));
        }
        text.push_str(&format!(
            " ORDER BY c.{} DESC OFFSET {} LIMIT {}",
            ORDER_FIELD,
            QueryWindow::OFFSET_PARAMETER,
            QueryWindow::LIMIT_PARAMETER
        ));

        spec.query = text;
        spec = spec
            .with_parameter(QueryWindow::OFFSET_PARAMETER, filter.offset)
            .with_parameter(QueryWindow::LIMIT_PARAMETER, limit);

        tracing::debug!("Compiled {} query: {}", self.schema.name, spec.query);

        Ok(CompiledQuery {
            spec,
            limit,
            offset: filter.offset,
        })
    }

    fn limit(&self, requested: Option<u32>) -> Result<u32, DataError> {
        match requested {
            Some(0) => Err(DataError::Validation(
                "limit must be at least 1".to_string(),
            )),
            Some(limit) => Ok(limit.min(self.limits.max_limit)),
            None => Ok(self.limits.default_limit.min(self.limits.max_limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog::{ACCESSORIES, ACTIVITIES, PETS};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn compile(schema: &RecordSchema, filter: &Filter) -> Result<CompiledQuery, DataError> {
        QueryCompiler::new(schema, PageLimits::default()).compile(filter)
    }

    #[test]
    fn empty_filter_selects_everything() {
        let query = compile(&PETS, &Filter::new()).unwrap();
        assert_eq!(
            query.text(),
            "SELECT * FROM c ORDER BY c.createdAt DESC OFFSET @offset LIMIT @limit"
        );
        assert_eq!(query.spec.parameter("@limit"), Some(&json!(100)));
        assert_eq!(query.spec.parameter("@offset"), Some(&json!(0)));
    }

    #[test]
    fn term_matches_every_search_field() {
        let query = compile(&PETS, &Filter::new().with_term("Lu")).unwrap();
        assert_eq!(
            query.text(),
            "SELECT * FROM c WHERE (CONTAINS(c.name, @term) OR CONTAINS(c.notes, @term)) \
             ORDER BY c.createdAt DESC OFFSET @offset LIMIT @limit"
        );
        assert_eq!(query.spec.parameter("@term"), Some(&json!("Lu")));
    }

    #[test]
    fn predicates_join_with_and() {
        let filter = Filter::new()
            .with_term("chew")
            .with_category("type", "toy")
            .with_low_stock_only(true);
        let query = compile(&ACCESSORIES, &filter).unwrap();
        assert_eq!(
            query.text(),
            "SELECT * FROM c WHERE (CONTAINS(c.name, @term) OR CONTAINS(c.description, @term)) \
             AND c.type = @type AND c.stock < @lowStockThreshold \
             ORDER BY c.createdAt DESC OFFSET @offset LIMIT @limit"
        );
        assert_eq!(query.spec.parameter("@lowStockThreshold"), Some(&json!(10)));
    }

    #[test]
    fn low_stock_false_adds_nothing() {
        let query = compile(&ACCESSORIES, &Filter::new().with_low_stock_only(false)).unwrap();
        assert!(!query.text().contains("WHERE"));
        assert!(query.spec.parameter("@lowStockThreshold").is_none());
    }

    #[test]
    fn low_stock_requires_a_flag() {
        let err = compile(&PETS, &Filter::new().with_low_stock_only(true)).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn categories_are_validated() {
        assert!(compile(&PETS, &Filter::new().with_category("species", "dragon")).is_err());
        assert!(compile(&PETS, &Filter::new().with_category("colour", "brown")).is_err());
        assert!(compile(&PETS, &Filter::new().with_category("species", "cat")).is_ok());
    }

    #[test]
    fn hostile_term_stays_a_parameter() {
        let term = "' OR 1=1 --";
        let query = compile(&PETS, &Filter::new().with_term(term)).unwrap();
        assert!(!query.text().contains(term));
        assert!(!query.text().contains('\''));
        assert_eq!(query.spec.parameter("@term"), Some(&json!(term)));
    }

    #[test]
    fn hostile_category_value_is_rejected_or_bound() {
        let filter = Filter::new().with_category("petId", "p1\" OR c.id != \"");
        let query = compile(&ACTIVITIES, &filter).unwrap();
        assert!(query.text().contains("c.petId = @petId"));
        assert!(!query.text().contains("OR c.id"));
    }

    #[test]
    fn time_range_on_activities() {
        let from = Utc.with_ymd_and_hms(2025, 10, 5, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 10, 6, 0, 0, 0).unwrap();
        let query = compile(&ACTIVITIES, &Filter::new().with_from(from).with_to(to)).unwrap();
        assert!(query
            .text()
            .contains("c.timestamp >= @from AND c.timestamp <= @to"));
        assert_eq!(
            query.spec.parameter("@from"),
            Some(&json!("2025-10-05T00:00:00.000000Z"))
        );

        assert!(compile(&ACTIVITIES, &Filter::new().with_from(to).with_to(from)).is_err());
        assert!(compile(&PETS, &Filter::new().with_from(from)).is_err());
    }

    mod limits {
        use super::*;

        #[test]
        fn limit_is_clamped_to_max() {
            let query = compile(&PETS, &Filter::new().with_limit(5000)).unwrap();
            assert_eq!(query.limit, 1000);
            assert_eq!(query.spec.parameter("@limit"), Some(&json!(1000)));
        }

        #[test]
        fn zero_limit_is_rejected() {
            assert_eq!(
                compile(&PETS, &Filter::new().with_limit(0)).unwrap_err().kind(),
                "validation"
            );
        }

        #[test]
        fn window_matches_the_page() {
            let query = compile(&PETS, &Filter::new().with_limit(10).with_offset(30)).unwrap();
            let window = query.window();
            assert_eq!(window.order_by, "createdAt");
            assert!(window.descending);
            assert_eq!((window.offset, window.limit), (30, 10));

            let ranged = window.range_query(&query.spec);
            assert_eq!(ranged.parameter("@offset"), Some(&json!(0)));
            assert_eq!(ranged.parameter("@limit"), Some(&json!(40)));
        }

        #[test]
        fn custom_limits_apply() {
            let limits = PageLimits {
                default_limit: 20,
                max_limit: 50,
            };
            let compiler = QueryCompiler::new(&PETS, limits);
            assert_eq!(compiler.compile(&Filter::new()).unwrap().limit, 20);
            assert_eq!(compiler.compile(&Filter::new().with_limit(75)).unwrap().limit, 50);
            let page = compiler.compile(&Filter::new().with_offset(40)).unwrap();
            assert_eq!(page.offset, 40);
        }
    }
}
