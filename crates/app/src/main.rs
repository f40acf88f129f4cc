use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pdf_chat_core::{
    discover_model_files, ChatOptions, ChatSession, ChunkingConfig, EmbeddingFailurePolicy,
    IndexProgress, IndexReport, IndexingOptions, LlamaServerRuntime, ModelConfig, RuntimeHints,
    TurnEvent, TurnState,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-chat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Base URL of the llama.cpp-compatible inference server
    #[arg(long, env = "PDF_CHAT_SERVER_URL", default_value = "http://localhost:8080")]
    server_url: String,

    /// Folder scanned for .gguf model files
    #[arg(long, env = "PDF_CHAT_MODELS_DIR", default_value = "models")]
    models_dir: PathBuf,

    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Args)]
struct Tuning {
    /// Context window requested for the model.
    #[arg(long, default_value = "2048")]
    n_ctx: u32,

    /// Thread cap carried with the model.
    #[arg(long)]
    max_threads: Option<usize>,

    /// Memory cap in GiB carried with the model.
    #[arg(long)]
    max_ram_gb: Option<f32>,

    /// Target fragment size in characters.
    #[arg(long, default_value = "600")]
    chunk_size: usize,

    /// Characters shared by consecutive fragments.
    #[arg(long, default_value = "100")]
    chunk_overlap: usize,

    /// Fragments above this token count are split before embedding.
    #[arg(long, default_value = "300")]
    token_threshold: usize,

    /// Concurrent tokenize requests during indexing.
    #[arg(long, default_value = "4")]
    tokenize_concurrency: usize,

    /// Fail indexing when any text cannot be embedded.
    #[arg(long, default_value_t = false)]
    strict_embeddings: bool,
}

impl Tuning {
    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            n_ctx: self.n_ctx,
            hints: RuntimeHints {
                max_threads: self.max_threads,
                max_ram_gb: self.max_ram_gb,
            },
            ..ModelConfig::default()
        }
    }

    fn indexing_options(&self) -> IndexingOptions {
        IndexingOptions {
            chunking: ChunkingConfig::with_size(self.chunk_size, self.chunk_overlap),
            token_threshold: self.token_threshold,
            tokenize_concurrency: self.tokenize_concurrency,
            failure_policy: if self.strict_embeddings {
                EmbeddingFailurePolicy::Fail
            } else {
                EmbeddingFailurePolicy::Drop
            },
            ..IndexingOptions::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// List the model files available in the models folder.
    Models,
    /// Index a PDF with a model and print the report.
    Index {
        /// Model name from the models folder, a path, or a URL.
        #[arg(long)]
        model: String,
        /// PDF to index.
        #[arg(long)]
        pdf: PathBuf,
    },
    /// Chat with a model, optionally grounded on a PDF.
    Chat {
        /// Model name from the models folder, a path, or a URL.
        #[arg(long)]
        model: String,
        /// PDF to index before the first question.
        #[arg(long)]
        pdf: Option<PathBuf>,
        /// Replaces the default system prompt.
        #[arg(long)]
        system_prompt: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-chat boot"
    );

    match &cli.command {
        Command::Models => list_models(&cli.models_dir),
        Command::Index { model, pdf } => {
            let mut session = build_session(&cli, None)?;
            let model = resolve_model(&cli.models_dir, model);
            session
                .load_model(&model)
                .await
                .with_context(|| format!("loading {model}"))?;
            let report = index_pdf(&mut session, pdf).await?;
            print_report(&report);
            session.dispose().await?;
        }
        Command::Chat {
            model,
            pdf,
            system_prompt,
        } => {
            let mut session = build_session(&cli, system_prompt.clone())?;
            let model = resolve_model(&cli.models_dir, model);
            let switch = session
                .load_model(&model)
                .await
                .with_context(|| format!("loading {model}"))?;
            println!("model: {}", switch.model);

            if let Some(pdf) = pdf {
                let report = index_pdf(&mut session, pdf).await?;
                print_report(&report);
            }

            chat_loop(&mut session, &cli.models_dir).await?;
            session.dispose().await?;
        }
    }

    Ok(())
}

fn build_session(
    cli: &Cli,
    system_prompt: Option<String>,
) -> anyhow::Result<ChatSession<LlamaServerRuntime>> {
    let runtime = LlamaServerRuntime::new(&cli.server_url)
        .with_context(|| format!("invalid server url {}", cli.server_url))?;

    let mut chat_options = ChatOptions::default();
    if let Some(prompt) = system_prompt {
        chat_options.system_prompt = prompt;
    }

    Ok(ChatSession::new(runtime)
        .with_model_config(cli.tuning.model_config())
        .with_chat_options(chat_options)
        .with_indexing_options(cli.tuning.indexing_options()))
}

fn list_models(folder: &Path) {
    let models = discover_model_files(folder);
    if models.is_empty() {
        println!("no .gguf files under {}", folder.display());
        return;
    }
    for model in models {
        println!(
            "{}  {:.1} MiB",
            model.name,
            model.size_bytes as f64 / (1024.0 * 1024.0)
        );
    }
}

/// Maps names found in the models folder to their paths, shard by shard.
fn resolve_model(folder: &Path, identifier: &str) -> String {
    let identifier = identifier.trim();
    if identifier.starts_with("http://") || identifier.starts_with("https://") {
        return identifier.to_string();
    }

    identifier
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let candidate = folder.join(part);
            if candidate.is_file() {
                candidate.to_string_lossy().to_string()
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

async fn index_pdf(
    session: &mut ChatSession<LlamaServerRuntime>,
    pdf: &Path,
) -> anyhow::Result<IndexReport> {
    let bytes = tokio::fs::read(pdf)
        .await
        .with_context(|| format!("reading {}", pdf.display()))?;
    let name = pdf
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| pdf.display().to_string());

    let report = session
        .index_document(&name, &bytes, |progress: IndexProgress| {
            eprint!("\rindexing {}: {}/{}", name, progress.completed, progress.total);
        })
        .await
        .with_context(|| format!("indexing {}", pdf.display()))?;
    eprintln!();
    Ok(report)
}

fn print_report(report: &IndexReport) {
    println!(
        "indexed {}: {} chunks, {} pieces after token correction, {} embedded, {} dropped (model {})",
        report.document_name,
        report.source_chunks,
        report.corrected_pieces,
        report.embedded,
        report.dropped_pieces,
        report.model
    );
}

async fn chat_loop(
    session: &mut ChatSession<LlamaServerRuntime>,
    models_dir: &Path,
) -> anyhow::Result<()> {
    let handle = session.cancel_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !handle.cancel() {
                std::process::exit(130);
            }
        }
    });

    println!("type a question, /model <name>, /reset or /quit. Ctrl-C stops a reply.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset_conversation();
                println!("conversation cleared");
                continue;
            }
            _ => {}
        }

        if let Some(model) = line.strip_prefix("/model ") {
            let model = resolve_model(models_dir, model);
            match session.load_model(&model).await {
                Ok(switch) => {
                    println!("model: {}", switch.model);
                    for warning in switch.warnings {
                        println!("warning: {warning}");
                    }
                }
                Err(error) => println!("error: {error}"),
            }
            continue;
        }

        let mut printed = String::new();
        let outcome = session
            .send_turn(line, |event| match event {
                TurnEvent::Text(text) => {
                    match text.strip_prefix(printed.as_str()) {
                        Some(suffix) => print!("{suffix}"),
                        None => print!("\n{text}"),
                    }
                    let _ = std::io::stdout().flush();
                    printed = text;
                }
                TurnEvent::Warning(warning) => eprintln!("\nwarning: {warning}"),
                TurnEvent::State(_) => {}
            })
            .await;
        println!();

        match outcome {
            Ok(outcome) if outcome.state == TurnState::Failed => {
                warn!(warnings = outcome.warnings.len(), "turn failed");
            }
            Ok(_) => {}
            Err(error) => println!("error: {error}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_pass_through_unchanged() {
        assert_eq!(
            resolve_model(Path::new("models"), " https://host/m.gguf "),
            "https://host/m.gguf"
        );
    }

    #[test]
    fn catalog_names_resolve_to_paths() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a-00001.gguf"), b"gguf")?;

        let resolved = resolve_model(dir.path(), "a-00001.gguf, /elsewhere/b.gguf");
        let expected = format!("{},/elsewhere/b.gguf", dir.path().join("a-00001.gguf").display());
        assert_eq!(resolved, expected);
        Ok(())
    }

    #[test]
    fn strict_flag_selects_fail_policy() {
        let cli = Cli::parse_from(["pdf-chat", "--strict-embeddings", "models"]);
        assert_eq!(
            cli.tuning.indexing_options().failure_policy,
            EmbeddingFailurePolicy::Fail
        );
        assert_eq!(cli.tuning.model_config().n_ctx, 2048);
    }
}
