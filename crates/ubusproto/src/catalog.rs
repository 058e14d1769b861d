//! Object catalog returned by a List query.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Int32,
    Bool,
    Table,
    Array,
    Unspec,
}

impl ParamKind {
    /// Map a type name from the objects document.
    ///
    /// Accepts the `BLOBMSG_TYPE_*` spellings and short lowercase aliases.
    /// Anything else is `Unspec`.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "BLOBMSG_TYPE_STRING" | "string" => ParamKind::String,
            "BLOBMSG_TYPE_INT32" | "int32" | "int" => ParamKind::Int32,
            "BLOBMSG_TYPE_BOOL" | "bool" | "boolean" => ParamKind::Bool,
            "BLOBMSG_TYPE_TABLE" | "table" | "object" => ParamKind::Table,
            "BLOBMSG_TYPE_ARRAY" | "array" => ParamKind::Array,
            _ => ParamKind::Unspec,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Int32 => "int32",
            ParamKind::Bool => "bool",
            ParamKind::Table => "table",
            ParamKind::Array => "array",
            ParamKind::Unspec => "unspec",
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ParamDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

/// Everything a List query reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCatalog {
    /// Backend serving ordinary calls ("script" or "remote")
    pub backend: String,
    /// Broker connection state, when the remote backend is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    pub objects: Vec<ObjectDescriptor>,
}

impl ServiceCatalog {
    pub fn find(&self, object: &str) -> Option<&ObjectDescriptor> {
        self.objects.iter().find(|o| o.name == object)
    }
}
