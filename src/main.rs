use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing_subscriber::EnvFilter;
use vllm_hooks::tools::stream::{ExtractorFactory, TokenizerDecoder};
use vllm_hooks::tools::{FragmentExtractor, StreamingToolParser, TaggedJsonExtractor, ToolCall};
use vllm_hooks::utils::config::{AddressingMode, HookConfig};

/// Replay a model response through the streaming tool call parser, as if it
/// were being generated token by token.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a tokenizer.json file
    #[arg(long)]
    tokenizer: String,

    /// Text file holding the raw model output to replay
    #[arg(long)]
    input: String,

    /// Number of tokens delivered per step
    #[arg(long, default_value_t = 1)]
    chunk: usize,

    /// Number of concurrent requests replaying the same output (interleaved)
    #[arg(long, default_value_t = 1)]
    requests: usize,

    /// Optional JSON config (special tokens, scheduler, tool stream settings)
    #[arg(long)]
    config: Option<String>,
}

#[derive(Serialize)]
struct ToolCallLine<'a> {
    request_id: &'a str,
    step: usize,
    tool_call: &'a ToolCall,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    if args.chunk == 0 {
        anyhow::bail!("--chunk must be at least 1");
    }
    if args.requests == 0 {
        anyhow::bail!("--requests must be at least 1");
    }

    let config = match &args.config {
        Some(path) => HookConfig::from_file(path).map_err(|e| {
            vllm_hooks::log_error!("Failed to load config {}: {}", path, e);
            e
        })?,
        None => HookConfig::default(),
    };
    let stream_config = config.tool_stream.clone();

    let tokenizer = Tokenizer::from_file(&args.tokenizer)
        .map_err(|e| anyhow!("Unable to load tokenizer {}: {}", args.tokenizer, e))?;
    let text = std::fs::read_to_string(&args.input)?;
    let token_ids = tokenizer
        .encode(text.as_str(), false)
        .map_err(|e| anyhow!("Unable to encode {}: {}", args.input, e))?
        .get_ids()
        .to_vec();
    vllm_hooks::log_info!(
        "Replaying {} tokens from {} in chunks of {}",
        token_ids.len(),
        args.input,
        args.chunk
    );

    let decoder = Arc::new(TokenizerDecoder::new(
        tokenizer,
        stream_config.skip_special_tokens,
    ));
    let template = TaggedJsonExtractor::from_config(&stream_config)?;
    let (mut parser, num_requests) = match stream_config.addressing {
        AddressingMode::Multi => {
            let factory: ExtractorFactory = Box::new(move || -> Box<dyn FragmentExtractor> {
                Box::new(template.clone())
            });
            (StreamingToolParser::multi(decoder, factory), args.requests)
        }
        AddressingMode::Single => {
            if args.requests > 1 {
                vllm_hooks::log_warn!(
                    "Single addressing mode tracks one request, ignoring --requests {}",
                    args.requests
                );
            }
            (StreamingToolParser::single(decoder, Box::new(template)), 1)
        }
    };

    let request_ids: Vec<String> = (0..num_requests).map(|i| format!("req-{i}")).collect();
    let mut emitted = 0usize;
    for (step, chunk) in token_ids.chunks(args.chunk).enumerate() {
        for request_id in &request_ids {
            let Some(calls) = parser.process(request_id, chunk) else {
                continue;
            };
            for call in &calls {
                let line = ToolCallLine {
                    request_id,
                    step,
                    tool_call: call,
                };
                println!("{}", serde_json::to_string(&line)?);
            }
            emitted += calls.len();
        }
    }

    for request_id in &request_ids {
        parser.reset(request_id);
    }
    vllm_hooks::log_info!(
        "Replay finished: {} tool calls across {} requests",
        emitted,
        num_requests
    );
    Ok(())
}
