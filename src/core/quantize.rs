//! Configuration handed to the external quantization runner.
//!
//! The runner receives this as a flat JSON object; nothing here performs any
//! quantization.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use strum::{Display, EnumString};

pub const DEFAULT_OUT_ROOT: &str = "/workspace/out";
pub const DEFAULT_HF_HOME: &str = "/workspace/hf";
pub const DEFAULT_HF_DATASETS_CACHE: &str = "/workspace/hf/datasets";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum QuantMethod {
    Awq,
    Nvfp4,
    Gguf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Binary,
    Safetensors,
}

pub const AWQ_BIT_WIDTHS: &[u32] = &[2, 3, 4, 5, 8];

pub const GGUF_QUANT_TYPES: &[&str] = &[
    "Q2_K", "Q3_K_S", "Q3_K_M", "Q3_K_L", "Q4_0", "Q4_1", "Q4_K_S", "Q4_K_M", "Q5_0", "Q5_1",
    "Q5_K_S", "Q5_K_M", "Q6_K", "Q8_0", "F16", "F32",
];

pub const GGUF_INTERMEDIATE_FORMATS: &[&str] = &["f16", "f32", "q8_0"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("model_id is required")]
    MissingModelId,
    #[error("Invalid quant_method: {0}")]
    InvalidQuantMethod(String),
    #[error("Invalid output_format: {0}")]
    InvalidOutputFormat(String),
    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),
    #[error("Invalid w_bit for AWQ: {0}")]
    InvalidBitWidth(u32),
    #[error("Invalid gguf_quant_type: {0}. Must be one of: {list}", list = GGUF_QUANT_TYPES.join(", "))]
    InvalidGgufQuantType(String),
    #[error("Invalid gguf_intermediate_format: {0}. Must be one of: f16, f32, q8_0")]
    InvalidGgufIntermediateFormat(String),
}

fn default_max_calib_samples() -> u32 {
    256
}

fn default_max_seq_length() -> u32 {
    2048
}

fn default_w_bit() -> u32 {
    4
}

fn default_group_size() -> u32 {
    128
}

fn default_true() -> bool {
    true
}

fn default_fp4() -> String {
    "fp4".to_string()
}

fn default_gguf_quant_type() -> String {
    "Q4_K_M".to_string()
}

fn default_gguf_intermediate_format() -> String {
    "f16".to_string()
}

fn default_hf_home() -> String {
    DEFAULT_HF_HOME.to_string()
}

fn default_hf_datasets_cache() -> String {
    DEFAULT_HF_DATASETS_CACHE.to_string()
}

/// Settings for one quantization run.
///
/// Build with [`QuantizationConfig::new`] or deserialize from a file, then
/// call [`QuantizationConfig::normalize`] and [`QuantizationConfig::validate`]
/// before handing it to the job service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub model_id: String,
    pub quant_method: String,
    pub output_format: String,
    pub calib_dataset: String,
    #[serde(default)]
    pub calib_config: Option<String>,
    #[serde(default)]
    pub calib_split: Option<String>,
    #[serde(default = "default_max_calib_samples")]
    pub max_calib_samples: u32,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: u32,

    // AWQ
    #[serde(default = "default_w_bit")]
    pub w_bit: u32,
    #[serde(default = "default_group_size")]
    pub group_size: u32,
    #[serde(default = "default_true")]
    pub zero_point: bool,

    // NVFP4
    #[serde(default = "default_fp4")]
    pub act_scheme: String,
    #[serde(default = "default_fp4")]
    pub w_scheme: String,
    #[serde(default)]
    pub non_uniform: bool,
    #[serde(default)]
    pub mix_fp8: bool,

    // GGUF
    #[serde(default = "default_gguf_quant_type")]
    pub gguf_quant_type: String,
    #[serde(default = "default_gguf_intermediate_format")]
    pub gguf_intermediate_format: String,

    #[serde(default = "default_hf_home")]
    pub hf_home: String,
    #[serde(default = "default_hf_datasets_cache")]
    pub hf_datasets_cache: String,
    /// Derived from the model id and method when not given
    #[serde(default)]
    pub out_dir: Option<String>,
}

impl QuantizationConfig {
    pub fn new(
        model_id: impl Into<String>,
        quant_method: impl Into<String>,
        output_format: impl Into<String>,
        calib_dataset: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            quant_method: quant_method.into(),
            output_format: output_format.into(),
            calib_dataset: calib_dataset.into(),
            calib_config: None,
            calib_split: None,
            max_calib_samples: default_max_calib_samples(),
            max_seq_length: default_max_seq_length(),
            w_bit: default_w_bit(),
            group_size: default_group_size(),
            zero_point: true,
            act_scheme: default_fp4(),
            w_scheme: default_fp4(),
            non_uniform: false,
            mix_fp8: false,
            gguf_quant_type: default_gguf_quant_type(),
            gguf_intermediate_format: default_gguf_intermediate_format(),
            hf_home: default_hf_home(),
            hf_datasets_cache: default_hf_datasets_cache(),
            out_dir: None,
        }
    }

    /// Canonicalise letter case and fill in `out_dir` under `out_root`.
    pub fn normalize(mut self, out_root: &Path) -> Self {
        self.quant_method = self.quant_method.to_lowercase();
        self.output_format = self.output_format.to_lowercase();
        self.gguf_quant_type = self.gguf_quant_type.to_uppercase();
        self.gguf_intermediate_format = self.gguf_intermediate_format.to_lowercase();
        if self.out_dir.is_none() {
            self.out_dir = Some(self.default_out_dir(out_root));
        }
        self
    }

    /// `<out_root>/<model name>-<METHOD>[-safetensors]`
    pub fn default_out_dir(&self, out_root: &Path) -> String {
        let model_name = self
            .model_id
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .replace(':', "-");
        let format_suffix = if self.output_format.eq_ignore_ascii_case("safetensors") {
            "-safetensors"
        } else {
            ""
        };
        out_root
            .join(format!(
                "{model_name}-{}{format_suffix}",
                self.quant_method.to_uppercase()
            ))
            .to_string_lossy()
            .into_owned()
    }

    pub fn method(&self) -> Result<QuantMethod, ConfigError> {
        QuantMethod::from_str(&self.quant_method)
            .map_err(|_| ConfigError::InvalidQuantMethod(self.quant_method.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_id.trim().is_empty() {
            return Err(ConfigError::MissingModelId);
        }
        let method = self.method()?;
        OutputFormat::from_str(&self.output_format)
            .map_err(|_| ConfigError::InvalidOutputFormat(self.output_format.clone()))?;

        if self.max_calib_samples == 0 {
            return Err(ConfigError::NotPositive("max_calib_samples"));
        }
        if self.max_seq_length == 0 {
            return Err(ConfigError::NotPositive("max_seq_length"));
        }
        if self.group_size == 0 {
            return Err(ConfigError::NotPositive("group_size"));
        }

        match method {
            QuantMethod::Awq => {
                if !AWQ_BIT_WIDTHS.contains(&self.w_bit) {
                    return Err(ConfigError::InvalidBitWidth(self.w_bit));
                }
            }
            QuantMethod::Gguf => {
                if !GGUF_QUANT_TYPES.contains(&self.gguf_quant_type.as_str()) {
                    return Err(ConfigError::InvalidGgufQuantType(
                        self.gguf_quant_type.clone(),
                    ));
                }
                if !GGUF_INTERMEDIATE_FORMATS.contains(&self.gguf_intermediate_format.as_str()) {
                    return Err(ConfigError::InvalidGgufIntermediateFormat(
                        self.gguf_intermediate_format.clone(),
                    ));
                }
            }
            QuantMethod::Nvfp4 => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awq() -> QuantizationConfig {
        QuantizationConfig::new("meta-llama/Llama-3.1-8B", "AWQ", "Binary", "wikitext")
            .normalize(Path::new(DEFAULT_OUT_ROOT))
    }

    #[test]
    fn test_normalize_and_default_out_dir() {
        let config = awq();
        assert_eq!(config.quant_method, "awq");
        assert_eq!(config.output_format, "binary");
        assert_eq!(
            config.out_dir.as_deref(),
            Some("/workspace/out/Llama-3.1-8B-AWQ")
        );
        assert!(config.validate().is_ok());

        let config = QuantizationConfig::new("org/model:v2", "gguf", "safetensors", "c4")
            .normalize(Path::new("/data/out"));
        assert_eq!(config.out_dir.as_deref(), Some("/data/out/model-v2-GGUF-safetensors"));
    }

    #[test]
    fn test_explicit_out_dir_is_kept() {
        let mut config = QuantizationConfig::new("org/model", "nvfp4", "binary", "c4");
        config.out_dir = Some("/custom".to_string());
        let config = config.normalize(Path::new(DEFAULT_OUT_ROOT));
        assert_eq!(config.out_dir.as_deref(), Some("/custom"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = awq();
        config.model_id.clear();
        assert_eq!(config.validate(), Err(ConfigError::MissingModelId));

        let mut config = awq();
        config.quant_method = "gptq".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidQuantMethod("gptq".to_string()))
        );

        let mut config = awq();
        config.output_format = "onnx".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidOutputFormat(_))));

        let mut config = awq();
        config.w_bit = 6;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBitWidth(6)));

        let mut config = awq();
        config.max_seq_length = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive("max_seq_length"))
        );
    }

    #[test]
    fn test_gguf_validation() {
        let config = QuantizationConfig::new("org/model", "gguf", "binary", "c4")
            .normalize(Path::new(DEFAULT_OUT_ROOT));
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.gguf_quant_type = "q4_k_x".to_string();
        let bad = bad.normalize(Path::new(DEFAULT_OUT_ROOT));
        let err = bad.validate().unwrap_err();
        assert_eq!(err, ConfigError::InvalidGgufQuantType("Q4_K_X".to_string()));
        assert!(err.to_string().contains("Q4_K_M"));

        let mut bad = config;
        bad.gguf_intermediate_format = "bf16".to_string();
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidGgufIntermediateFormat(_))
        ));
    }

    #[test]
    fn test_serializes_flat() {
        let value = serde_json::to_value(awq()).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.values().all(|v| !v.is_object() && !v.is_array()));
        assert_eq!(object["w_bit"], 4);
        assert_eq!(object["gguf_quant_type"], "Q4_K_M");
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: QuantizationConfig = serde_json::from_str(
            r#"{"model_id":"org/m","quant_method":"awq","output_format":"binary","calib_dataset":"c4"}"#,
        )
        .unwrap();
        assert_eq!(config.max_calib_samples, 256);
        assert_eq!(config.group_size, 128);
        assert!(config.zero_point);
        assert_eq!(config.out_dir, None);
    }
}
