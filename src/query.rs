use crate::error::{Error, Result};
use crate::value::Value;

/// The closed set of filter predicates a query can carry.
///
/// Membership operators (`ArrayContainsAny`, `In`, `NotIn`) take a sequence
/// operand; every other operator takes a scalar. The arity rule is enforced
/// when the filter is built, never at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    /// Whether the operand must be a `Value::Sequence`.
    pub fn takes_sequence(self) -> bool {
        matches!(
            self,
            Operator::ArrayContainsAny | Operator::In | Operator::NotIn
        )
    }
}

/// One predicate: `field <operator> value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Filter {
    /// Validates the operator/value arity rule and builds the filter.
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Result<Self> {
        if operator.takes_sequence() && !matches!(value, Value::Sequence(_)) {
            return Err(Error::InvalidFilter(format!(
                "{operator:?} requires a sequence operand, got {}",
                value.type_name()
            )));
        }
        if !operator.takes_sequence() && !value.is_scalar() {
            return Err(Error::InvalidFilter(format!(
                "{operator:?} requires a scalar operand, got {}",
                value.type_name()
            )));
        }
        Ok(Self {
            field: field.into(),
            operator,
            value,
        })
    }
}

/// An immutable, backend-neutral description of a collection query.
///
/// Structural equality (order-sensitive on filters) is what de-duplicates
/// live subscriptions: two descriptors that compare equal share one
/// backend-level stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryDescriptor {
    pub collection_path: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<String>,
    pub limit: Option<u32>,
}

impl QueryDescriptor {
    /// A bare query matching every document of a collection.
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            collection_path: path.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }
}

/// Composes filters, ordering, and a row limit into a [`QueryDescriptor`].
///
/// Pure data assembly; no backend access happens here. Call order is
/// unconstrained, and a malformed filter surfaces immediately from
/// [`QueryBuilder::filter`] rather than at execution.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    descriptor: QueryDescriptor,
}

impl QueryBuilder {
    pub fn new(collection_path: impl Into<String>) -> Self {
        Self {
            descriptor: QueryDescriptor::collection(collection_path),
        }
    }

    /// Appends a filter; all filters apply conjunctively.
    pub fn filter(
        mut self,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Result<Self> {
        self.descriptor
            .filters
            .push(Filter::new(field, operator, value.into())?);
        Ok(self)
    }

    /// Orders results ascending by `field`; ties break on document id.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.descriptor.order_by = Some(field.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.descriptor.limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<QueryDescriptor> {
        if self.descriptor.limit == Some(0) {
            return Err(Error::InvalidFilter("limit must be positive".into()));
        }
        Ok(self.descriptor)
    }
}
