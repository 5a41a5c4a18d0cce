use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{CallerSuppliedProvider, RuntimeConfig, StringDelimitedKeyBuilder, get_default_cache_dir};
use engine::{AggregatorClosureNode, ByteStreamSource, Chunk, EngineError, NodeLogic, Source, UpstreamHandle};
use feature::{Feature, PersistenceSettings};
use model::Model;
use serde::{Deserialize, Serialize};
use store::FileSystemDatabase;
use tokio::fs;

/// On-disk settings for this binary: where blobs live and how big a chunk a
/// source reads at a time. Write defaults on first run, load thereafter.
#[derive(Clone, Serialize, Deserialize)]
struct CliConfig {
    runtime: RuntimeConfig,
    database_dir: PathBuf,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            database_dir: get_default_cache_dir().join("blobs"),
        }
    }
}

async fn load_or_init_config() -> Result<CliConfig> {
    let config_dir = get_default_cache_dir();
    let config_path = config_dir.join("config.toml");

    if !config_path.exists() {
        fs::create_dir_all(&config_dir).await?;
        let config = CliConfig::default();
        fs::write(&config_path, toml::to_string(&config)?).await?;
        Ok(config)
    } else {
        let contents = fs::read(&config_path).await?;
        Ok(toml::from_slice(&contents)?)
    }
}

/// Demo model: a byte stream, tokenized into words (unstored), reduced to a
/// per-word count (stored). Exercises the full root -> extractor -> stored
/// feature pipeline end to end.
fn word_count_model(database: Arc<dyn store::Database>, chunk_size: usize) -> Model {
    let persistence = PersistenceSettings::new(
        Arc::new(CallerSuppliedProvider::new("doc_id")),
        Arc::new(StringDelimitedKeyBuilder::default()),
        database,
    );

    let stream = Arc::new(Feature::root(
        "stream",
        false,
        None,
        Arc::new(|| Box::new(engine::IdentityEncoder::default())),
        "application/octet-stream",
        Arc::new(engine::RawDecoder),
    ));
    let tokens = Arc::new(Feature::text(
        "tokens",
        "tokenizer",
        Vec::new(),
        vec![Arc::clone(&stream)],
        false,
        None,
        Arc::new(tokenizer),
    ));
    let count = Arc::new(Feature::bincode(
        "count",
        "wordcount",
        Vec::new(),
        vec![Arc::clone(&tokens)],
        true,
        None,
        Arc::new(word_counter),
    ));

    Model::new(
        vec![
            ("stream".to_string(), stream),
            ("tokens".to_string(), tokens),
            ("count".to_string(), count),
        ],
        persistence,
        chunk_size,
    )
}

struct Tokenizer {
    cache: Option<Chunk>,
    buffer: String,
}

impl NodeLogic for Tokenizer {
    fn name(&self) -> &str {
        "tokenizer"
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.cache = Some(data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        self.cache
            .take()
            .ok_or_else(|| EngineError::NotEnoughData(self.name().to_owned()))
    }

    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        self.buffer.push_str(data.as_text().unwrap_or(""));
        let mut out = Vec::new();
        if let Some(last_space) = self.buffer.rfind(char::is_whitespace) {
            let complete = self.buffer[..last_space].to_string();
            for word in complete.split_whitespace() {
                out.push(Chunk::text(word.to_string()));
            }
            self.buffer = self.buffer[last_space + 1..].to_string();
        }
        Ok(out)
    }

    fn process_final(&mut self) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        let out = self.buffer.split_whitespace().map(Chunk::text).collect();
        self.buffer.clear();
        Ok(out)
    }
}

fn tokenizer() -> Box<dyn NodeLogic> {
    Box::new(Tokenizer {
        cache: None,
        buffer: String::new(),
    })
}

fn word_counter() -> Box<dyn NodeLogic> {
    Box::new(
        AggregatorClosureNode::new("wordcount", true, |items: &[Chunk]| {
            let mut counts = BTreeMap::new();
            for item in items {
                if let Some(word) = item.as_text() {
                    *counts.entry(word.to_string()).or_insert(0u64) += 1;
                }
            }
            vec![Chunk::Counts(counts)]
        })
        .unwrap(),
    )
}

#[derive(Parser)]
#[command(name = "extractor-cli", about = "Runs documents through the word-count demo model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extracts features for one input file and persists the stored ones.
    Process {
        /// Path to the file to read as the root byte stream.
        input: PathBuf,
        /// Document id to store results under; a content hash of the input
        /// is used if omitted.
        #[arg(long)]
        doc_id: Option<String>,
    },
    /// Fetches one feature for a previously processed document.
    Fetch {
        doc_id: String,
        #[arg(long, default_value = "count")]
        feature: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = load_or_init_config().await?;
    let database = Arc::new(FileSystemDatabase::new(camino::Utf8PathBuf::try_from(config.database_dir.clone())?).await?);
    let model = word_count_model(database, config.runtime.chunk_size);

    match Cli::parse().command {
        Command::Process { input, doc_id } => {
            let bytes = fs::read(&input).await.with_context(|| format!("reading {}", input.display()))?;
            let doc_id = doc_id.unwrap_or_else(|| blake3::hash(&bytes).to_hex().to_string());

            let mut context = std::collections::HashMap::new();
            context.insert("doc_id".to_string(), doc_id.clone());

            let mut sources: std::collections::HashMap<String, Box<dyn Source>> = std::collections::HashMap::new();
            sources.insert("stream".to_string(), Box::new(ByteStreamSource::new(bytes, config.runtime.chunk_size)));

            let stored_id = model.process(&context, sources).await.map_err(|err| anyhow!(err.to_string()))?;
            log::info!("processed document {}", stored_id);
            println!("{}", stored_id);
        }
        Command::Fetch { doc_id, feature } => {
            let doc = model.document(common::DocId::new(doc_id));
            let value = doc.get(&feature).await.map_err(|err| anyhow!(err.to_string()))?;
            match value {
                Chunk::Counts(counts) => {
                    for (word, count) in counts {
                        println!("{word}\t{count}");
                    }
                }
                Chunk::Text(text) => println!("{text}"),
                Chunk::Bytes(bytes) => println!("{} bytes", bytes.len()),
                Chunk::Number(n) => println!("{n}"),
                Chunk::Json(value) => println!("{value}"),
                Chunk::Unit => {}
            }
        }
    }

    Ok(())
}
