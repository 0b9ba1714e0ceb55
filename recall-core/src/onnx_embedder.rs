//! ONNX embedding backend: local inference via `all-MiniLM-L6-v2`
//!
//! Uses the `ort` crate for ONNX Runtime and `tokenizers` for WordPiece
//! tokenization. Produces 384-dimensional, L2-normalised sentence embeddings
//! entirely offline (mean pooling over the last hidden state, the same recipe
//! sentence-transformers applies to this model).

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Tokenizer, TruncationParams};

use crate::embeddings::{EmbeddingBackend, EmbeddingError, OnnxConfig};

pub const DEFAULT_MODEL_FILE: &str = "all-MiniLM-L6-v2.onnx";
pub const DEFAULT_TOKENIZER_FILE: &str = "all-MiniLM-L6-v2-tokenizer.json";

/// Local ONNX embedding client.
pub struct OnnxEmbeddingClient {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    dimensions: usize,
}

impl std::fmt::Debug for OnnxEmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEmbeddingClient")
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl OnnxEmbeddingClient {
    /// Load the model and tokenizer named in `config`.
    ///
    /// Returns `EmbeddingError::ModelNotFound` if either file is missing.
    pub fn new(config: OnnxConfig) -> Result<Self, EmbeddingError> {
        for path in [&config.model_path, &config.tokenizer_path] {
            if !path.exists() {
                return Err(EmbeddingError::ModelNotFound {
                    path: path.display().to_string(),
                });
            }
        }

        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(&config.model_path))
            .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

        let mut tokenizer = Tokenizer::from_file(&config.tokenizer_path)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_tokens,
                ..TruncationParams::default()
            }))
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        tracing::info!(
            model = %config.model_path.display(),
            dimensions = config.dimensions,
            max_tokens = config.max_tokens,
            "ONNX embedding model loaded"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OnnxEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        // CPU-bound; keep it off the async workers.
        let session = Arc::clone(&self.session);
        let tokenizer = Arc::clone(&self.tokenizer);
        let dimensions = self.dimensions;
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = session
                .lock()
                .map_err(|e| EmbeddingError::OnnxInference(format!("session lock poisoned: {e}")))?;
            embed_sync(&mut guard, &tokenizer, &text, dimensions)
        })
        .await
        .map_err(|e| EmbeddingError::OnnxInference(format!("spawn_blocking join error: {e}")))?
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

fn embed_sync(
    session: &mut Session,
    tokenizer: &Tokenizer,
    text: &str,
    expected_dims: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

    let to_i64 = |xs: &[u32]| xs.iter().map(|&x| x as i64).collect::<Vec<i64>>();
    let input_ids = to_i64(encoding.get_ids());
    let attention_mask = to_i64(encoding.get_attention_mask());
    let token_type_ids = to_i64(encoding.get_type_ids());

    let shape = vec![1i64, input_ids.len() as i64];
    let onnx_err = |e: ort::Error| EmbeddingError::OnnxInference(e.to_string());

    let inputs = ort::inputs! {
        "input_ids" => Tensor::from_array((shape.clone(), input_ids)).map_err(onnx_err)?,
        "attention_mask" => Tensor::from_array((shape.clone(), attention_mask.clone())).map_err(onnx_err)?,
        "token_type_ids" => Tensor::from_array((shape, token_type_ids)).map_err(onnx_err)?,
    };

    let outputs = session.run(inputs).map_err(onnx_err)?;

    // last_hidden_state: [1, seq_len, hidden_dim]
    let (out_shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(onnx_err)?;
    if out_shape.len() != 3 {
        return Err(EmbeddingError::OnnxInference(format!(
            "Expected 3D output, got {}D",
            out_shape.len()
        )));
    }
    let seq_len = out_shape[1] as usize;
    let hidden_dim = out_shape[2] as usize;

    let mut pooled = mean_pool(data, &attention_mask, seq_len, hidden_dim);
    l2_normalize(&mut pooled);

    if pooled.len() != expected_dims {
        return Err(EmbeddingError::InvalidDimensions {
            expected: expected_dims,
            actual: pooled.len(),
        });
    }
    Ok(pooled)
}

/// Average token vectors whose attention mask is set.
fn mean_pool(hidden: &[f32], mask: &[i64], seq_len: usize, hidden_dim: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; hidden_dim];
    let mut counted = 0.0f32;

    for (tok, &m) in mask.iter().enumerate().take(seq_len) {
        if m == 0 {
            continue;
        }
        counted += 1.0;
        let row = &hidden[tok * hidden_dim..(tok + 1) * hidden_dim];
        for (acc, &x) in pooled.iter_mut().zip(row) {
            *acc += x;
        }
    }

    if counted > 0.0 {
        pooled.iter_mut().for_each(|v| *v /= counted);
    }
    pooled
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// `$XDG_DATA_HOME/recall/models`, or `~/.local/share/recall/models`.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("recall/models")
}

/// Resolve paths for the ONNX model and its tokenizer.
///
/// An empty `onnx_model_path` selects the default location; otherwise the
/// tokenizer is expected next to the model as `{stem}-tokenizer.json`.
pub fn resolve_onnx_paths(onnx_model_path: &str) -> (PathBuf, PathBuf) {
    if onnx_model_path.is_empty() {
        let dir = default_model_dir();
        return (dir.join(DEFAULT_MODEL_FILE), dir.join(DEFAULT_TOKENIZER_FILE));
    }

    let model = PathBuf::from(shellexpand::tilde(onnx_model_path).into_owned());
    let stem = model
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let tokenizer = model.with_file_name(format!("{stem}-tokenizer.json"));
    (model, tokenizer)
}
