//! Pure-Rust fallback inference path for platforms without a prebuilt ORT
//! binary (musl, Intel Mac): loads the ONNX graph with `tract-onnx`,
//! tokenizes with `tokenizers`, and mean-pools + L2-normalizes the output by
//! hand. Slower than the fastembed path but has no system dependencies.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Result};
use tract_onnx::prelude::*;

type RunnableModel = TypedRunnableModel<TypedModel>;

const REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const ONNX_REL: &str = "onnx/model.onnx";
const TOKENIZER_REL: &str = "tokenizer.json";
const DIMS: usize = super::LOCAL_DIMS;
const MAX_SEQ_LEN: usize = 256;
const BATCH_SIZE: usize = 16;

fn cache_dir() -> Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base).join(".cache").join("convo-reflect").join("models");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn download_to_cache(path: &str, cache_path: &Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!("https://huggingface.co/{REPO}/resolve/main/{}", path.replace(' ', "%20"));
    let bytes = reqwest::blocking::get(&url)?.error_for_status()?.bytes()?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(cache_path, &bytes)?;
    Ok(())
}

fn ensure_cached() -> Result<(PathBuf, PathBuf)> {
    let dir = cache_dir()?.join("all-minilm-l6-v2");
    let onnx_path = dir.join(ONNX_REL);
    let tokenizer_path = dir.join(TOKENIZER_REL);
    download_to_cache(ONNX_REL, &onnx_path)?;
    download_to_cache(TOKENIZER_REL, &tokenizer_path)?;
    Ok((onnx_path, tokenizer_path))
}

static LOADED: OnceLock<(tokenizers::Tokenizer, RunnableModel)> = OnceLock::new();

fn load() -> Result<&'static (tokenizers::Tokenizer, RunnableModel)> {
    if let Some(loaded) = LOADED.get() {
        return Ok(loaded);
    }
    let (onnx_path, tokenizer_path) = ensure_cached()?;
    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;
    let model = tract_onnx::onnx()
        .model_for_path(onnx_path)?
        .into_optimized()?
        .into_runnable()?;
    let _ = LOADED.set((tokenizer, model));
    Ok(LOADED.get().expect("model initialized above"))
}

pub fn embed(texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let (tokenizer, model) = load()?;

    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(BATCH_SIZE) {
        let encodings: Vec<_> = batch
            .iter()
            .map(|s| tokenizer.encode(s.as_str(), true).map_err(|e| anyhow::anyhow!("tokenize: {e}")))
            .collect::<Result<Vec<_>>>()?;

        let max_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(1).min(MAX_SEQ_LEN);
        let n = encodings.len();
        let mut input_ids = vec![0i64; n * max_len];
        let mut attention_mask = vec![0i64; n * max_len];

        for (i, enc) in encodings.iter().enumerate() {
            let ids = enc.get_ids();
            let len = ids.len().min(max_len);
            for (j, &id) in ids.iter().take(len).enumerate() {
                input_ids[i * max_len + j] = id as i64;
                attention_mask[i * max_len + j] = 1;
            }
        }

        let input_ids_t: Tensor = ndarray::Array2::from_shape_vec((n, max_len), input_ids)?.into();
        let attention_mask_t: Tensor = ndarray::Array2::from_shape_vec((n, max_len), attention_mask)?.into();
        let result = model.run(tvec!(input_ids_t.into(), attention_mask_t.into()))?;

        let output = result.into_iter().next().ok_or_else(|| anyhow::anyhow!("no output tensor"))?;
        let view = output.to_array_view::<f32>()?;
        let shape = view.shape();

        if shape.len() == 2 {
            for i in 0..shape[0] {
                let row: Vec<f32> = view.slice(ndarray::s![i, ..]).iter().copied().collect();
                out.push(normalize_l2(row));
            }
        } else if shape.len() == 3 {
            let seq_len = shape[1];
            for (i, enc) in encodings.iter().enumerate() {
                let valid_len = enc.get_ids().len().min(seq_len).min(max_len);
                let mut sum = vec![0f32; DIMS];
                let mut count = 0f32;
                for j in 0..valid_len {
                    for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().enumerate() {
                        if k < DIMS {
                            sum[k] += v;
                        }
                    }
                    count += 1.0;
                }
                if count > 0.0 {
                    for x in &mut sum {
                        *x /= count;
                    }
                }
                out.push(normalize_l2(sum));
            }
        } else {
            bail!("unexpected tract output shape: {:?}", shape);
        }
    }

    Ok(out)
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
