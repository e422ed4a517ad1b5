//! Attribute-policy model.
//!
//! Each (resource type, attribute short-name) pair maps to an
//! [`AttributePolicy`] recording the data type, cardinality, whether the
//! attribute may appear in create/update requests, and how it is treated
//! when the resource is announced.

/// Data types an attribute value is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Integer,
    /// Integer >= 1
    PositiveInteger,
    /// Integer >= 0
    NonNegInteger,
    Bool,
    /// RFC 3339 timestamp string
    Timestamp,
    /// JSON array of strings
    ListOfStrings,
    /// JSON array with unconstrained element type
    List,
    /// JSON object with type-specific structure, checked by custom rules
    Complex,
    /// Unconstrained value (e.g. contentInstance `con`)
    Any,
}

impl AttributeType {
    pub fn name(&self) -> &'static str {
        match self {
            AttributeType::String => "string",
            AttributeType::Integer => "integer",
            AttributeType::PositiveInteger => "positive integer",
            AttributeType::NonNegInteger => "non-negative integer",
            AttributeType::Bool => "boolean",
            AttributeType::Timestamp => "timestamp",
            AttributeType::ListOfStrings => "list of strings",
            AttributeType::List => "list",
            AttributeType::Complex => "object",
            AttributeType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    Multiple,
}

/// Whether an attribute may, must, or must not appear in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOptionality {
    Mandatory,
    Optional,
    /// Server-managed; presence in a request is an error.
    NotPresent,
}

/// Treatment of an attribute in the announced projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncePolicy {
    /// Always part of the announced resource
    MandatoryAnnounced,
    /// Included when listed in `aa`
    OptionalAnnounced,
    NotAnnounced,
}

#[derive(Debug, Clone, Copy)]
pub struct AttributePolicy {
    pub data_type: AttributeType,
    pub cardinality: Cardinality,
    pub create: RequestOptionality,
    pub update: RequestOptionality,
    pub announce: AnnouncePolicy,
}

impl AttributePolicy {
    pub const fn new(
        data_type: AttributeType,
        cardinality: Cardinality,
        create: RequestOptionality,
        update: RequestOptionality,
        announce: AnnouncePolicy,
    ) -> Self {
        Self {
            data_type,
            cardinality,
            create,
            update,
            announce,
        }
    }

    pub fn is_announceable(&self) -> bool {
        !matches!(self.announce, AnnouncePolicy::NotAnnounced)
    }
}
