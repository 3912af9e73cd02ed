use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::search::embedder::{check_batch, Embedder};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use hf_hub::api::sync::Api;
use std::path::Path;
use std::sync::Mutex;
use tokenizers::{PaddingParams, Tokenizer};
use tracing::{debug, info};

/// Query instruction recommended for BGE retrieval models
const QUERY_INSTRUCTION: &str = "Represent this sentence for searching relevant passages: ";

/// Texts per forward pass
const FORWARD_BATCH: usize = 32;

/// Local BERT embedding model
pub struct EmbeddingModel {
    model_id: String,
    model: Mutex<BertModel>,
    tokenizer: Mutex<Tokenizer>,
    device: Device,
}

impl EmbeddingModel {
    /// Load the configured model, downloading it into the models directory on first use
    pub fn init(config: &Config) -> Result<Self> {
        let model_id = config.settings.embedding.model.clone();
        let model_dir = config.models_dir.join(model_id.replace('/', "--"));
        std::fs::create_dir_all(&model_dir)?;

        let model_path = model_dir.join("model.safetensors");
        let config_path = model_dir.join("config.json");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !(model_path.exists() && config_path.exists() && tokenizer_path.exists()) {
            Self::download_model(&model_id, &model_path, &config_path, &tokenizer_path)?;
        }

        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
        let (model, tokenizer) =
            Self::load_model_files(&model_path, &config_path, &tokenizer_path, &device)?;

        Ok(Self {
            model_id,
            model: Mutex::new(model),
            tokenizer: Mutex::new(tokenizer),
            device,
        })
    }

    /// Download model from HuggingFace Hub
    fn download_model(
        model_id: &str,
        model_path: &Path,
        config_path: &Path,
        tokenizer_path: &Path,
    ) -> Result<()> {
        info!(model = model_id, "downloading embedding model");

        let api = Api::new()?;
        let repo = api.model(model_id.to_string());

        let config_file = repo.get("config.json")?;
        let tokenizer_file = repo.get("tokenizer.json")?;
        let weights_file = repo.get("model.safetensors")?;

        std::fs::copy(&config_file, config_path)?;
        std::fs::copy(&tokenizer_file, tokenizer_path)?;
        std::fs::copy(&weights_file, model_path)?;

        info!(model = model_id, "embedding model downloaded");
        Ok(())
    }

    /// Load model files from disk
    fn load_model_files(
        model_path: &Path,
        config_path: &Path,
        tokenizer_path: &Path,
        device: &Device,
    ) -> Result<(BertModel, Tokenizer)> {
        debug!(path = %model_path.display(), "loading embedding model");

        let config_content = std::fs::read_to_string(config_path)?;
        let bert_config: BertConfig = serde_json::from_str(&config_content)
            .map_err(|e| Error::Model(format!("Failed to parse config: {}", e)))?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| Error::Tokenizer(format!("Failed to load tokenizer: {}", e)))?;
        let padding = PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        };
        tokenizer.with_padding(Some(padding));

        // Safety: the weights file is owned by the models directory and not
        // modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_path], DTYPE, device)
                .map_err(|e| Error::Model(format!("Failed to load weights: {}", e)))?
        };

        let model = BertModel::load(vb, &bert_config)
            .map_err(|e| Error::Model(format!("Failed to load model: {}", e)))?;

        Ok((model, tokenizer))
    }

    /// Generate L2-normalised CLS embeddings for texts
    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .model
            .lock()
            .map_err(|e| Error::Model(format!("Failed to lock model: {}", e)))?;
        let tokenizer = self
            .tokenizer
            .lock()
            .map_err(|e| Error::Model(format!("Failed to lock tokenizer: {}", e)))?;

        let mut result = Vec::with_capacity(texts.len());
        for batch in texts.chunks(FORWARD_BATCH) {
            let tokens = tokenizer
                .encode_batch(batch.to_vec(), true)
                .map_err(|e| Error::Tokenizer(format!("Tokenization failed: {}", e)))?;

            let token_ids = tokens
                .iter()
                .map(|t| Tensor::new(t.get_ids(), &self.device).map_err(Error::Candle))
                .collect::<Result<Vec<Tensor>>>()?;

            let token_ids = Tensor::stack(&token_ids, 0)?;
            let token_type_ids = token_ids.zeros_like()?;
            let embeddings = model.forward(&token_ids, &token_type_ids)?;

            // CLS pooling: [batch, seq, hidden] -> [batch, hidden]
            let pooled = embeddings.narrow(1, 0, 1)?.squeeze(1)?;
            let normalized = Self::normalize_l2(&pooled)?;

            let (n, _) = normalized.dims2()?;
            for i in 0..n {
                result.push(normalized.get(i)?.to_vec1()?);
            }
        }

        Ok(result)
    }

    /// L2 normalization
    fn normalize_l2(v: &Tensor) -> Result<Tensor> {
        Ok(v.broadcast_div(&v.sqr()?.sum_keepdim(1)?.sqrt()?)?)
    }
}

impl Embedder for EmbeddingModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self
            .embed(texts)
            .map_err(|e| Error::EmbeddingService(e.to_string()))?;
        check_batch(texts.len(), vectors)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self
            .embed(&[format!("{}{}", QUERY_INSTRUCTION, text)])
            .map_err(|e| Error::EmbeddingService(e.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingService("model returned no embedding".to_string()))
    }
}
