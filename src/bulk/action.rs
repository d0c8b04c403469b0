use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Bulk verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Index,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Index => "index",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }

    /// Whether a source line follows the action header
    pub fn has_source(&self) -> bool {
        !matches!(self, Verb::Delete)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(Verb::Index),
            "create" => Ok(Verb::Create),
            "update" => Ok(Verb::Update),
            "delete" => Ok(Verb::Delete),
            other => Err(format!("unknown action verb: {}", other)),
        }
    }
}

/// Parameters serialized into the action header line.
///
/// `script` and `upsert` only shape the body of an update and never appear
/// in the header.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionParams {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "_index", skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_on_conflict: Option<u32>,

    #[serde(skip)]
    pub script: Option<String>,

    #[serde(skip)]
    pub upsert: Option<Value>,
}

/// Where an update script comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    #[default]
    Inline,
    Indexed,
    File,
}

impl ScriptType {
    fn key(&self) -> &'static str {
        match self {
            ScriptType::Inline => "source",
            ScriptType::Indexed => "id",
            ScriptType::File => "file",
        }
    }
}

/// How update actions are turned into bodies.
///
/// `doc_as_upsert` and `scripted_upsert` are mutually exclusive; the
/// configuration layer rejects the combination.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOptions {
    pub doc_as_upsert: bool,
    pub scripted_upsert: bool,
    pub script_type: ScriptType,
    /// Empty means "let the cluster pick"
    pub script_lang: String,
    /// Name under which the document is exposed to scripts
    pub script_var_name: String,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            doc_as_upsert: false,
            scripted_upsert: false,
            script_type: ScriptType::Inline,
            script_lang: "painless".to_string(),
            script_var_name: "event".to_string(),
        }
    }
}

/// One write operation: verb, header parameters and document
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub verb: Verb,
    pub params: ActionParams,
    /// Absent for deletes
    pub document: Option<Value>,
}

impl Action {
    pub fn new(verb: Verb, params: ActionParams, document: Option<Value>) -> Self {
        Self {
            verb,
            params,
            document,
        }
    }

    pub fn index(params: ActionParams, document: Value) -> Self {
        Self::new(Verb::Index, params, Some(document))
    }

    pub fn create(params: ActionParams, document: Value) -> Self {
        Self::new(Verb::Create, params, Some(document))
    }

    pub fn update(params: ActionParams, document: Value) -> Self {
        Self::new(Verb::Update, params, Some(document))
    }

    pub fn delete(params: ActionParams) -> Self {
        Self::new(Verb::Delete, params, None)
    }

    /// Attach the document to a parent through a join field.
    ///
    /// Routing defaults to the parent id so children land on the parent's shard.
    pub fn with_join(mut self, field: &str, relation: &str, parent: &str) -> Self {
        if let Some(Value::Object(doc)) = self.document.as_mut() {
            doc.insert(
                field.to_string(),
                json!({ "name": relation, "parent": parent }),
            );
        }
        if self.params.routing.is_none() {
            self.params.routing = Some(parent.to_string());
        }
        self
    }

    /// Number of NDJSON lines this action serializes to
    pub fn line_count(&self) -> usize {
        if self.verb.has_source() {
            2
        } else {
            1
        }
    }

    /// Header line plus, except for deletes, the source line. Always ends
    /// with a newline.
    pub fn to_ndjson(&self, options: &UpdateOptions) -> Result<Vec<u8>, serde_json::Error> {
        let mut header = Map::new();
        header.insert(self.verb.as_str().to_string(), serde_json::to_value(&self.params)?);

        let mut out = serde_json::to_vec(&header)?;
        out.push(b'\n');

        if self.verb.has_source() {
            let document = self.document.clone().unwrap_or_else(|| json!({}));
            let source = if self.verb == Verb::Update {
                update_body(&self.params, document, options)
            } else {
                document
            };
            serde_json::to_writer(&mut out, &source)?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

/// Body of an update: plain doc, doc-as-upsert, scripted, or scripted upsert
pub fn update_body(params: &ActionParams, document: Value, options: &UpdateOptions) -> Value {
    let Some(script) = &params.script else {
        let mut body = json!({ "doc": document });
        if options.doc_as_upsert {
            body["doc_as_upsert"] = json!(true);
        } else if let Some(upsert) = &params.upsert {
            body["upsert"] = upsert.clone();
        }
        return body;
    };

    let mut script_params = Map::new();
    script_params.insert(options.script_var_name.clone(), document.clone());
    let mut body = json!({ "script": { "params": script_params } });

    if options.scripted_upsert {
        body["scripted_upsert"] = json!(true);
        body["upsert"] = json!({});
    } else if options.doc_as_upsert {
        body["upsert"] = document;
    } else if let Some(upsert) = &params.upsert {
        body["upsert"] = upsert.clone();
    }

    body["script"][options.script_type.key()] = json!(script);
    if !options.script_lang.is_empty() {
        body["script"]["lang"] = json!(options.script_lang);
    }
    body
}

/// Parse raw document bytes, replacing invalid UTF-8 first
pub fn document_from_bytes(raw: &[u8]) -> Result<Value, serde_json::Error> {
    let text = String::from_utf8_lossy(raw);
    serde_json::from_str(&text)
}
