use std::{env, fs, num::NonZeroUsize};

use anyhow::{Context, bail};
use log::{info, warn};

use gradient_buffer::{
    BufferConfig, BufferErr, GradientBuffer,
    arch::{BlockKind, TinyLm},
    data::{ByteTokenizer, TextStream, Tokenizer},
};

const DEFAULT_BATCHES: usize = 16;
const DEFAULT_LAYER: usize = 1;
const D_MODEL: usize = 32;
const MODEL_SEED: u64 = 0x5eed;

const DEMO_CTX_LEN: NonZeroUsize = NonZeroUsize::new(32).unwrap();
const DEMO_REFRESH_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(16).unwrap();
const DEMO_OUT_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(256).unwrap();

fn demo_config() -> BufferConfig {
    BufferConfig {
        n_ctxs: 64.0,
        ctx_len: DEMO_CTX_LEN,
        refresh_batch_size: DEMO_REFRESH_BATCH_SIZE,
        out_batch_size: DEMO_OUT_BATCH_SIZE,
        seed: Some(MODEL_SEED),
        ..Default::default()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let Some(corpus) = args.next() else {
        bail!("usage: gradient-buffer <corpus.jsonl> [config.json] [batches]");
    };

    let mut config: BufferConfig = match args.next() {
        Some(path) => {
            let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => demo_config(),
    };

    if let Ok(io) = env::var("IO") {
        config.io = io.parse()?;
    }

    let batches = match args.next() {
        Some(n) => n.parse().with_context(|| format!("invalid batch count {n}"))?,
        None => DEFAULT_BATCHES,
    };

    let layer = match env::var("LAYER") {
        Ok(layer) => layer.parse().with_context(|| format!("invalid LAYER {layer}"))?,
        Err(_) => DEFAULT_LAYER,
    };

    let tokenizer = ByteTokenizer::new();
    let model = TinyLm::seeded(
        tokenizer.vocab_size(),
        D_MODEL,
        &[BlockKind::Mlp, BlockKind::Mlp, BlockKind::Mlp],
        MODEL_SEED,
    );
    let source = TextStream::open(&corpus).with_context(|| format!("opening {corpus}"))?;

    let mut buffer = GradientBuffer::new(source, model, tokenizer, layer, config)?;
    info!("streaming gradients of layer {layer} from {corpus}");

    for (i, batch) in buffer.by_ref().take(batches).enumerate() {
        match batch {
            Ok(batch) => {
                let norm = batch.iter().map(|x| x * x).sum::<f32>().sqrt();
                info!(batch = i, rows = batch.nrows(), norm = norm; "gradient batch");
            }
            Err(BufferErr::EndOfStream) => {
                warn!("corpus exhausted after {i} batches");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    buffer.close()?;
    info!("config: {}", serde_json::to_string(buffer.config())?);
    info!("metrics: {}", serde_json::to_string(buffer.metrics())?);

    Ok(())
}
