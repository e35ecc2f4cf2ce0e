use serde::{Deserialize, Serialize};

/// Static information about a model artifact available for download.
/// This is hardcoded and never changes at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    /// Unique identifier, no spaces (e.g. "phi-2-q4_0")
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Filename on disk
    pub filename: String,
    /// Download URL
    pub url: String,
    /// Expected SHA-256 of the artifact (lowercase hex)
    pub sha256: String,
}

/// Hardcoded catalog of GGUF models known to work with llama.cpp-style
/// runtimes. SHA-256 hashes from the upstream Hugging Face repositories.
pub fn default_catalog() -> Vec<Model> {
    vec![
        Model {
            id: "phi-2-q4_0".into(),
            display_name: "Phi-2 7B (Q4_0, 1.6 GiB)".into(),
            filename: "phi-2-q4_0.gguf".into(),
            url: "https://huggingface.co/ggml-org/models/resolve/main/phi-2/ggml-model-q4_0.gguf?download=true".into(),
            sha256: "fd506d24a4bee6997a566b02b65715af5cadb433c6a3a47a74b467badc5727ca".into(),
        },
        Model {
            id: "tinyllama-1.1b-f16".into(),
            display_name: "TinyLlama 1.1B (f16, 2.2 GiB)".into(),
            filename: "tinyllama-1.1-f16.gguf".into(),
            url: "https://huggingface.co/ggml-org/models/resolve/main/tinyllama-1.1b/ggml-model-f16.gguf?download=true".into(),
            sha256: "92982a0b96adfe5a8cea15ed6272bd11282f9a257eca74e40225becc6ae61c71".into(),
        },
        Model {
            id: "phi-2-dpo-q3_k_m".into(),
            display_name: "Phi 2 DPO (Q3_K_M, 1.48 GiB)".into(),
            filename: "phi-2-dpo.Q3_K_M.gguf".into(),
            url: "https://huggingface.co/TheBloke/phi-2-dpo-GGUF/resolve/main/phi-2-dpo.Q3_K_M.gguf?download=true".into(),
            sha256: "e7effd3e3a3b6f1c05b914deca7c9646210bad34576d39d3c5c5f2a25cb97ae1".into(),
        },
    ]
}
