//! Retrieval agents: knowledge base context plus a chat completion

use super::{ChatClient, ChatMessage, InferenceEndpoint, JsonRow};
use crate::ast::Using;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kb::KnowledgeBase;
use crate::source::{FetchRequest, SourceHandle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const SUPPORTED_PROVIDERS: &[&str] = &[
    "openai",
    "anthropic",
    "litellm",
    "ollama",
    "nvidia_nim",
    "vllm",
    "google",
    "writer",
];

const WRITER_CHAT_MODELS: &[&str] = &["palmyra-x5", "palmyra-x4"];

pub const QUESTION_COLUMN: &str = "question";
pub const ANSWER_COLUMN: &str = "answer";
pub const CONTEXT_COLUMN: &str = "context";
pub const TRACE_ID_COLUMN: &str = "trace_id";

const DEFAULT_PROMPT_TEMPLATE: &str = "Answer the question using only the context below. \
If the context does not contain the answer, say so.\n\nContext:\n{{context}}\n\nQuestion: {{question}}";

/// Rows sampled from each table an agent is given
const TABLE_CONTEXT_ROWS: usize = 20;

/// `model = {...}` part of `CREATE AGENT`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatModelSpec {
    pub provider: String,
    pub model_name: String,
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    pub prompt_template: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatModelSpec {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model_name: "gpt-4o".to_string(),
            base_url: None,
            api_key_env: None,
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            temperature: 0.0,
            max_tokens: 8096,
        }
    }
}

impl ChatModelSpec {
    fn from_json(value: &JsonValue) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Config("agent model must be a map".into()))?;
        let mut spec = Self::default();
        for (key, v) in obj {
            let text = || {
                v.as_str()
                    .map(String::from)
                    .ok_or_else(|| Error::Config(format!("agent model {} must be a string", key)))
            };
            match key.as_str() {
                "provider" => spec.provider = text()?.to_lowercase(),
                "model_name" | "model" => spec.model_name = text()?,
                "base_url" => spec.base_url = Some(text()?),
                "api_key_env" => spec.api_key_env = Some(text()?),
                "prompt_template" | "prompt" => spec.prompt_template = text()?,
                "temperature" => {
                    spec.temperature = v
                        .as_f64()
                        .ok_or_else(|| Error::Config("temperature must be a number".into()))?
                        as f32
                }
                "max_tokens" => {
                    spec.max_tokens = v
                        .as_u64()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| Error::Config("max_tokens must be a positive integer".into()))?
                        as u32
                }
                other => debug!("Ignoring agent model option '{}'", other),
            }
        }

        if !SUPPORTED_PROVIDERS.contains(&spec.provider.as_str()) {
            return Err(Error::Config(format!(
                "unsupported agent provider '{}' (expected one of: {})",
                spec.provider,
                SUPPORTED_PROVIDERS.join(", ")
            )));
        }
        if spec.provider == "writer" && !WRITER_CHAT_MODELS.contains(&spec.model_name.as_str()) {
            return Err(Error::Config(format!(
                "writer agents support {} only",
                WRITER_CHAT_MODELS.join(", ")
            )));
        }
        Ok(spec)
    }
}

/// Parsed `CREATE AGENT ... USING model = {...}, data = {...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDef {
    pub model: ChatModelSpec,
    pub knowledge_bases: Vec<String>,
    /// Qualified `source.table` names
    pub tables: Vec<String>,
    /// Chunks retrieved per knowledge base
    pub context_k: usize,
}

fn names(value: &JsonValue, key: &str) -> Result<Vec<String>> {
    match value {
        JsonValue::String(s) => Ok(vec![s.to_lowercase()]),
        JsonValue::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_lowercase)
                    .ok_or_else(|| Error::Config(format!("data.{} must list names", key)))
            })
            .collect(),
        _ => Err(Error::Config(format!("data.{} must be a string or list", key))),
    }
}

impl AgentDef {
    pub fn from_using(using: &Using, config: &Config) -> Result<Self> {
        let mut def = Self {
            model: ChatModelSpec::default(),
            knowledge_bases: Vec::new(),
            tables: Vec::new(),
            context_k: config.knowledge_base.default_k.min(5),
        };
        for (key, value) in using {
            match key.to_lowercase().as_str() {
                "model" => def.model = ChatModelSpec::from_json(value)?,
                "data" => {
                    let obj = value
                        .as_object()
                        .ok_or_else(|| Error::Config("agent data must be a map".into()))?;
                    for (k, v) in obj {
                        match k.as_str() {
                            "knowledge_bases" => def.knowledge_bases = names(v, k)?,
                            "tables" => def.tables = names(v, k)?,
                            other => debug!("Ignoring agent data option '{}'", other),
                        }
                    }
                }
                "context_k" => {
                    def.context_k = value
                        .as_u64()
                        .filter(|k| *k > 0)
                        .ok_or_else(|| Error::Config("context_k must be a positive integer".into()))?
                        as usize
                }
                other => debug!("Ignoring agent option '{}'", other),
            }
        }
        Ok(def)
    }

    pub fn output_columns() -> Vec<String> {
        [ANSWER_COLUMN, CONTEXT_COLUMN, TRACE_ID_COLUMN]
            .map(String::from)
            .to_vec()
    }
}

/// Answers `question` rows with retrieved context
pub struct AgentEndpoint {
    name: String,
    def: AgentDef,
    chat: ChatClient,
    knowledge_bases: Vec<Arc<KnowledgeBase>>,
    tables: Vec<(Arc<SourceHandle>, String)>,
}

impl AgentEndpoint {
    pub fn new(
        name: &str,
        def: AgentDef,
        knowledge_bases: Vec<Arc<KnowledgeBase>>,
        tables: Vec<(Arc<SourceHandle>, String)>,
        config: &Config,
    ) -> Result<Self> {
        let base_url = def
            .model
            .base_url
            .clone()
            .unwrap_or_else(|| config.inference.chat_base_url.clone());
        let api_key = def
            .model
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        let mut chat = ChatClient::new(
            &base_url,
            &def.model.model_name,
            api_key,
            Duration::from_secs(config.inference.agent_timeout_secs),
        )?;
        chat.temperature = def.model.temperature;
        chat.max_tokens = def.model.max_tokens;
        Ok(Self {
            name: name.to_string(),
            def,
            chat,
            knowledge_bases,
            tables,
        })
    }

    async fn table_context(&self) -> Result<Vec<String>> {
        let mut context = Vec::new();
        for (source, table) in &self.tables {
            let request = FetchRequest {
                limit: Some(TABLE_CONTEXT_ROWS),
                ..FetchRequest::table(table)
            };
            let batch = source.fetch(&request).await?;
            for row in batch.to_json_rows() {
                context.push(JsonValue::Object(row).to_string());
            }
        }
        Ok(context)
    }

    async fn answer(&self, question: &str, table_context: &[String]) -> Result<JsonRow> {
        let mut context: Vec<String> = Vec::new();
        for kb in &self.knowledge_bases {
            let hits = kb.search(question, &[], self.def.context_k).await?;
            context.extend(hits.into_iter().map(|h| h.chunk.content));
        }
        context.extend(table_context.iter().cloned());

        let prompt = self
            .def
            .model
            .prompt_template
            .replace("{{context}}", &context.join("\n---\n"))
            .replace("{{question}}", question);
        let answer = self.chat.complete(&[ChatMessage::user(prompt)]).await?;

        let mut row = JsonRow::new();
        row.insert(ANSWER_COLUMN.to_string(), JsonValue::String(answer));
        row.insert(
            CONTEXT_COLUMN.to_string(),
            JsonValue::Array(context.into_iter().map(JsonValue::String).collect()),
        );
        row.insert(
            TRACE_ID_COLUMN.to_string(),
            JsonValue::String(uuid::Uuid::new_v4().to_string()),
        );
        Ok(row)
    }
}

#[async_trait]
impl InferenceEndpoint for AgentEndpoint {
    async fn predict(&self, rows: Vec<JsonRow>) -> Result<Vec<JsonRow>> {
        let table_context = self.table_context().await?;
        let mut output = Vec::with_capacity(rows.len());
        for row in rows {
            let question = row
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(QUESTION_COLUMN))
                .and_then(|(_, v)| v.as_str())
                .ok_or_else(|| {
                    Error::inference_permanent(format!(
                        "agent {} needs a '{}' text column",
                        self.name, QUESTION_COLUMN
                    ))
                })?;
            output.push(self.answer(question, &table_context).await?);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;
    use serde_json::json;
    use crate::kb::KnowledgeBaseDef;
    use crate::value::{Batch, Schema, Value};
    use crate::vector::MemoryVectorStore;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_agent_def_parsing() {
        let using = json!({
            "model": {"provider": "ollama", "model_name": "llama3", "base_url": "http://x"},
            "data": {"knowledge_bases": ["Docs"], "tables": "crm.customers"}
        });
        let def = AgentDef::from_using(using.as_object().unwrap(), &Config::default()).unwrap();
        assert_eq!(def.model.provider, "ollama");
        assert_eq!(def.model.model_name, "llama3");
        assert_eq!(def.knowledge_bases, vec!["docs"]);
        assert_eq!(def.tables, vec!["crm.customers"]);
    }

    #[test]
    fn test_defaults_and_provider_validation() {
        let def = AgentDef::from_using(&Using::new(), &Config::default()).unwrap();
        assert_eq!(def.model.model_name, "gpt-4o");
        assert_eq!(def.model.max_tokens, 8096);

        let bad = json!({"model": {"provider": "acme"}});
        assert!(AgentDef::from_using(bad.as_object().unwrap(), &Config::default()).is_err());

        let writer = json!({"model": {"provider": "writer", "model_name": "gpt-4o"}});
        assert!(AgentDef::from_using(writer.as_object().unwrap(), &Config::default()).is_err());
    }

    #[tokio::test]
    async fn test_agent_answers_with_retrieved_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("Rust has no garbage collector"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "No GC."}}]
            })))
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.embedding.backend = "hashing".to_string();
        config.embedding.dimension = 32;
        let kb_def = KnowledgeBaseDef::from_using(&Using::new(), &config).unwrap();
        let kb = KnowledgeBase::with_providers(
            "docs",
            kb_def,
            Arc::new(MemoryVectorStore::new()),
            Arc::new(HashingEmbedder::new(32)),
            None,
            4,
        )
        .await
        .unwrap();
        kb.write(&Batch::new(
            Schema::from_names(&["content"]),
            vec![vec![Value::from("Rust has no garbage collector")]],
        ))
        .await
        .unwrap();

        let using = json!({"model": {"provider": "openai", "base_url": server.uri()}});
        let def = AgentDef::from_using(using.as_object().unwrap(), &config).unwrap();
        let agent = AgentEndpoint::new("helper", def, vec![Arc::new(kb)], Vec::new(), &config).unwrap();

        let question = json!({"question": "Does Rust have a GC?"}).as_object().unwrap().clone();
        let out = agent.predict(vec![question]).await.unwrap();
        assert_eq!(out[0][ANSWER_COLUMN], "No GC.");
        assert_eq!(out[0][CONTEXT_COLUMN][0], "Rust has no garbage collector");
        assert!(uuid::Uuid::parse_str(out[0][TRACE_ID_COLUMN].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_missing_question_is_permanent() {
        let config = Config::default();
        let def = AgentDef::from_using(&Using::new(), &config).unwrap();
        let agent = AgentEndpoint::new("a", def, Vec::new(), Vec::new(), &config).unwrap();
        let err = agent.predict(vec![JsonRow::new()]).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
