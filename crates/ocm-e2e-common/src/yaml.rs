//! YAML decoding for test data manifests
//!
//! Manifests are parsed with yaml-rust2 and converted into `serde_json::Value`
//! so they can be turned into `DynamicObject`s without a second YAML model.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::{Error, Result};

/// Parse every document of a (possibly multi-document) YAML string.
///
/// Empty documents (a trailing `---`, comment-only sections) are dropped.
pub fn parse_documents(input: &str) -> Result<Vec<Value>> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::serialization(format!("invalid YAML: {}", e)))?;
    let mut values = Vec::with_capacity(docs.len());
    for doc in docs {
        let value = to_json(doc)?;
        if !value.is_null() {
            values.push(value);
        }
    }
    Ok(values)
}

fn to_json(yaml: Yaml) -> Result<Value> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|_| Error::serialization(format!("invalid float '{}'", s)))?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(items.into_iter().map(to_json).collect::<Result<_>>()?),
        Yaml::Hash(map) => {
            let mut object = Map::with_capacity(map.len());
            for (k, v) in map {
                let key = match k {
                    Yaml::String(s) | Yaml::Real(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    other => {
                        return Err(Error::serialization(format!(
                            "unsupported YAML key: {:?}",
                            other
                        )))
                    }
                };
                object.insert(key, to_json(v)?);
            }
            Value::Object(object)
        }
        Yaml::Alias(_) => return Err(Error::serialization("YAML aliases are not supported")),
        Yaml::BadValue => return Err(Error::serialization("bad YAML value")),
    })
}
