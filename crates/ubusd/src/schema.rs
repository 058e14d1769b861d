//! Objects document: which objects and methods to expose on the bus.
//!
//! ```json
//! [
//!   { "object": "lamp",
//!     "method": [
//!       { "name": "set", "param": [ { "name": "level", "type": "BLOBMSG_TYPE_INT32" } ] }
//!     ] }
//! ]
//! ```
//!
//! Parsing is lenient per entry: a malformed object, method or parameter is
//! skipped and reported, its siblings still load. Only an unreadable file or
//! a top level that is not a JSON array fails the whole document.

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, warn};
use ubusproto::ParamKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSchema {
    pub name: String,
    pub kind: ParamKind,
}

/// One callable method, in declaration order of its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSchema {
    pub object: String,
    pub name: String,
    pub params: Vec<ParamSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSchema {
    pub name: String,
    pub methods: Vec<MethodSchema>,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("cannot open config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("config file {path} format is wrong: top level must be an array")]
    NotArray { path: PathBuf },
}

/// Result of parsing a document that was readable at the top level.
#[derive(Debug, Default)]
pub struct ParsedObjects {
    pub objects: Vec<ObjectSchema>,
    /// One line per skipped entry, already logged
    pub problems: Vec<String>,
}

/// Read and parse the objects document at `path`.
pub fn load_objects(path: &Path) -> Result<ParsedObjects, SchemaError> {
    let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_objects(&text, path)
}

/// Parse an objects document. `origin` only labels diagnostics.
pub fn parse_objects(text: &str, origin: &Path) -> Result<ParsedObjects, SchemaError> {
    let doc: Value = serde_json::from_str(text).map_err(|source| SchemaError::Json {
        path: origin.to_path_buf(),
        source,
    })?;

    let entries = doc.as_array().ok_or_else(|| SchemaError::NotArray {
        path: origin.to_path_buf(),
    })?;

    let mut parsed = ParsedObjects::default();
    for (idx, entry) in entries.iter().enumerate() {
        let object = entry.get("object").and_then(Value::as_str);
        let methods = entry.get("method").and_then(Value::as_array);

        let (Some(object), Some(methods)) = (object, methods) else {
            let problem = format!(
                "config file {} format is wrong: entry {} needs a string \"object\" and a \"method\" array",
                origin.display(),
                idx
            );
            error!("{}", problem);
            parsed.problems.push(problem);
            continue;
        };

        let mut schema = ObjectSchema {
            name: object.to_string(),
            methods: Vec::with_capacity(methods.len()),
        };

        for (midx, method) in methods.iter().enumerate() {
            let Some(name) = method.get("name").and_then(Value::as_str) else {
                let problem = format!(
                    "config file {} format is wrong: {} method {} has no string \"name\"",
                    origin.display(),
                    object,
                    midx
                );
                error!("{}", problem);
                parsed.problems.push(problem);
                continue;
            };

            let params = method
                .get("param")
                .and_then(Value::as_array)
                .map(|list| parse_params(list, object, name, &mut parsed.problems))
                .unwrap_or_default();

            schema.methods.push(MethodSchema {
                object: object.to_string(),
                name: name.to_string(),
                params,
            });
        }

        parsed.objects.push(schema);
    }

    Ok(parsed)
}

fn parse_params(list: &[Value], object: &str, method: &str, problems: &mut Vec<String>) -> Vec<ParamSchema> {
    let mut params = Vec::with_capacity(list.len());
    for param in list {
        let name = param.get("name").and_then(Value::as_str);
        let kind = param.get("type").and_then(Value::as_str);
        match (name, kind) {
            (Some(name), Some(kind)) => params.push(ParamSchema {
                name: name.to_string(),
                kind: ParamKind::from_type_name(kind),
            }),
            _ => {
                let problem = format!("{}.{}: parameter without string name/type skipped", object, method);
                warn!("{}", problem);
                problems.push(problem);
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> ParsedObjects {
        parse_objects(text, Path::new("objects.json")).unwrap()
    }

    #[test]
    fn test_single_object() {
        let parsed = parse(r#"[{"object":"lamp","method":[{"name":"on","param":[]}]}]"#);
        assert!(parsed.problems.is_empty());
        assert_eq!(
            parsed.objects,
            vec![ObjectSchema {
                name: "lamp".into(),
                methods: vec![MethodSchema {
                    object: "lamp".into(),
                    name: "on".into(),
                    params: vec![],
                }],
            }]
        );
    }

    #[test]
    fn test_param_kinds_and_order() {
        let parsed = parse(
            r#"[{"object":"net","method":[{"name":"set","param":[
                {"name":"ifname","type":"BLOBMSG_TYPE_STRING"},
                {"name":"mtu","type":"BLOBMSG_TYPE_INT32"},
                {"name":"up","type":"BLOBMSG_TYPE_BOOL"},
                {"name":"opts","type":"BLOBMSG_TYPE_TABLE"},
                {"name":"dns","type":"BLOBMSG_TYPE_ARRAY"},
                {"name":"ratio","type":"BLOBMSG_TYPE_DOUBLE"}
            ]}]}]"#,
        );
        let kinds: Vec<(String, ParamKind)> = parsed.objects[0].methods[0]
            .params
            .iter()
            .map(|p| (p.name.clone(), p.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("ifname".into(), ParamKind::String),
                ("mtu".into(), ParamKind::Int32),
                ("up".into(), ParamKind::Bool),
                ("opts".into(), ParamKind::Table),
                ("dns".into(), ParamKind::Array),
                ("ratio".into(), ParamKind::Unspec),
            ]
        );
    }

    #[test]
    fn test_malformed_entries_do_not_block_siblings() {
        let parsed = parse(
            r#"[
                {"method":[{"name":"orphan"}]},
                {"object":"broken","method":"not-a-list"},
                {"object":42,"method":[]},
                {"object":"lamp","method":[{"param":[]},{"name":"off"}]},
                {"object":"fan","method":[{"name":"spin"}]}
            ]"#,
        );

        let names: Vec<&str> = parsed.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["lamp", "fan"]);
        assert_eq!(parsed.objects[0].methods.len(), 1);
        assert_eq!(parsed.objects[0].methods[0].name, "off");
        assert_eq!(parsed.problems.len(), 4);
        assert!(parsed.problems[0].contains("format is wrong"));
    }

    #[test]
    fn test_method_without_param_list() {
        let parsed = parse(r#"[{"object":"lamp","method":[{"name":"toggle"}]}]"#);
        assert!(parsed.objects[0].methods[0].params.is_empty());
    }

    #[test]
    fn test_bad_param_skipped() {
        let parsed = parse(
            r#"[{"object":"lamp","method":[{"name":"set","param":[
                {"name":"level"},
                {"name":"color","type":"BLOBMSG_TYPE_STRING"}
            ]}]}]"#,
        );
        let params = &parsed.objects[0].methods[0].params;
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "color");
        assert_eq!(parsed.problems.len(), 1);
    }

    #[test]
    fn test_top_level_errors() {
        let err = parse_objects("{\"object\":\"lamp\"}", Path::new("x.json")).unwrap_err();
        assert!(matches!(err, SchemaError::NotArray { .. }));

        let err = parse_objects("[{", Path::new("x.json")).unwrap_err();
        assert!(matches!(err, SchemaError::Json { .. }));

        let err = load_objects(Path::new("/nonexistent/iot-ubusd.json")).unwrap_err();
        assert!(matches!(err, SchemaError::Read { .. }));
    }
}
