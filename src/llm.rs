//! LLM arbiter: single-token SIM/NAO classification for ambiguous bids.
//!
//! The model is treated strictly as an oracle: narrow Portuguese prompt,
//! one-token answer, temperature zero. Any reply that is not `SIM` is
//! conservatively a `NAO`. Decisions are memoized process-wide keyed by
//! an md5 of the full classification input; the cache grows unbounded
//! and is only cleared explicitly.
//!
//! Safe defaults when the arbiter is disabled or the oracle errors:
//! primary-match → reject, recovery → do not recover.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;

use crate::config::Config;
use crate::filter::keywords::PromptLevel;
use crate::filter::{ArbiterRequest, RelevanceArbiter};
use crate::metrics;

/// Cap on object text sent to the oracle, to bound token cost.
const OBJETO_MAX_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "Você é um classificador conservador de licitações. \
    Em caso de dúvida, responda NAO. \
    Apenas responda SIM se o contrato é CLARAMENTE e PRIMARIAMENTE sobre o setor. \
    Responda APENAS 'SIM' ou 'NAO'.";

const RECOVERY_SYSTEM_PROMPT: &str = "Você é um classificador de licitações que avalia se \
    contratos rejeitados automaticamente são relevantes. Responda APENAS 'SIM' ou 'NAO'.";

pub struct LlmArbiter {
    enabled: bool,
    model: String,
    max_tokens: u32,
    temperature: f32,
    api_key: Option<String>,
    base_url: String,
    http: reqwest::Client,
    cache: DashMap<String, bool>,
}

impl LlmArbiter {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.llm_arbiter_enabled && config.openai_api_key.is_some(),
            model: config.llm_arbiter_model.clone(),
            max_tokens: config.llm_arbiter_max_tokens,
            temperature: config.llm_arbiter_temperature,
            api_key: config.openai_api_key.clone(),
            base_url: config.openai_base_url.clone(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            cache: DashMap::new(),
        }
    }

    /// An arbiter that always answers with the safe defaults. Used when
    /// no oracle is configured and by tests.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            model: String::new(),
            max_tokens: 1,
            temperature: 0.0,
            api_key: None,
            base_url: String::new(),
            http: reqwest::Client::new(),
            cache: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(base_url: &str, enabled: bool) -> Self {
        Self {
            enabled,
            model: "gpt-4o-mini".into(),
            max_tokens: 1,
            temperature: 0.0,
            api_key: Some("test-key".into()),
            base_url: base_url.to_string(),
            http: reqwest::Client::new(),
            cache: DashMap::new(),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Explicit eviction only; there is no TTL.
    pub fn clear_cache(&self) {
        self.cache.clear();
        tracing::info!("LLM arbiter cache cleared");
    }

    fn context_of(request: &ArbiterRequest) -> (String, String) {
        match (&request.sector_name, &request.custom_terms) {
            (Some(name), _) => ("setor".to_string(), name.clone()),
            (None, Some(terms)) => ("termos".to_string(), terms.join(", ")),
            (None, None) => ("setor".to_string(), String::new()),
        }
    }

    fn truncated_objeto(request: &ArbiterRequest) -> String {
        request.objeto.chars().take(OBJETO_MAX_CHARS).collect()
    }

    pub(crate) fn cache_key(mode: &str, request: &ArbiterRequest) -> String {
        let (_, context) = Self::context_of(request);
        let objeto = Self::truncated_objeto(request);
        let tail = match mode {
            "recovery" => request.rejection_reason.clone().unwrap_or_default(),
            _ => request.prompt_level.as_str().to_string(),
        };
        let input = format!("{}:{}:{}:{}:{}", mode, context, request.valor, objeto, tail);
        format!("{:x}", md5::compute(input.as_bytes()))
    }

    fn primary_prompt(request: &ArbiterRequest) -> String {
        let objeto = Self::truncated_objeto(request);
        let (mode, context) = Self::context_of(request);

        if mode == "termos" {
            return format!(
                "Termos buscados: {}\nValor: R$ {:.2}\nObjeto: {}\n\n\
                 Os termos buscados descrevem o OBJETO PRINCIPAL deste contrato \
                 (não itens secundários)?\nResponda APENAS: SIM ou NAO",
                context, request.valor, objeto
            );
        }

        match request.prompt_level {
            PromptLevel::Conservative => format!(
                "Você é um classificador de licitações públicas. Analise se o contrato é \
                 PRIMARIAMENTE sobre o setor especificado (> 80% do valor e escopo).\n\n\
                 SETOR: {context}\n\n\
                 CONTRATO:\nValor: R$ {valor:.2}\nObjeto: {objeto}\n\n\
                 EXEMPLOS DE CLASSIFICAÇÃO:\n\n\
                 SIM:\n\
                 - \"Uniformes escolares para rede municipal\"\n\
                 - \"Fardamento para guardas municipais\"\n\n\
                 NAO:\n\
                 - \"Processo seletivo para contratação de servidores\"\n\
                 - \"Obra de infraestrutura com fornecimento de uniformes para operários\"\n\n\
                 Este contrato é PRIMARIAMENTE sobre {context}?\nResponda APENAS: SIM ou NAO",
                context = context,
                valor = request.valor,
                objeto = objeto,
            ),
            PromptLevel::Standard => format!(
                "Setor: {}\nValor: R$ {:.2}\nObjeto: {}\n\n\
                 Este contrato é PRIMARIAMENTE sobre {}?\nResponda APENAS: SIM ou NAO",
                context, request.valor, objeto, context
            ),
        }
    }

    fn recovery_prompt(request: &ArbiterRequest) -> String {
        let objeto = Self::truncated_objeto(request);
        let (mode, context) = Self::context_of(request);
        let reason = request.rejection_reason.as_deref().unwrap_or("desconhecido");
        let near_miss = request
            .near_miss_info
            .as_deref()
            .map(|info| format!("\nSinônimos encontrados: {}", info))
            .unwrap_or_default();

        if mode == "termos" {
            format!(
                "Este contrato foi REJEITADO automaticamente por: {}\n\n\
                 Termos buscados: {}\nValor: R$ {:.2}\nObjeto: {}\n\n\
                 Apesar da rejeição, os termos buscados descrevem o OBJETO PRINCIPAL \
                 deste contrato?\nResponda APENAS: SIM ou NAO",
                reason, context, request.valor, objeto
            )
        } else {
            format!(
                "Este contrato foi REJEITADO automaticamente por: {}\n\n\
                 Setor: {}\nValor: R$ {:.2}\nObjeto: {}{}\n\n\
                 Apesar da rejeição automática, este contrato é RELEVANTE para {}?\n\
                 Responda APENAS: SIM ou NAO",
                reason, context, request.valor, objeto, near_miss, context
            )
        }
    }

    /// One chat-completions call. Anything other than a reply starting
    /// with `SIM` is a NAO.
    async fn ask(&self, system: &str, user: &str) -> anyhow::Result<bool> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.as_deref().unwrap_or_default())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: serde_json::Value = response.json().await?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(content.trim().to_uppercase().starts_with("SIM"))
    }

    async fn classify(&self, mode: &str, request: &ArbiterRequest, safe_default: bool) -> bool {
        if !self.enabled {
            tracing::debug!(mode = mode, "LLM arbiter disabled, returning safe default");
            return safe_default;
        }
        if request.sector_name.is_none() && request.custom_terms.is_none() {
            tracing::error!(mode = mode, "arbiter called without sector or custom terms");
            return safe_default;
        }

        let key = Self::cache_key(mode, request);
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(mode = mode, "LLM arbiter cache hit");
            return *cached;
        }

        let (system, user) = match mode {
            "recovery" => (RECOVERY_SYSTEM_PROMPT, Self::recovery_prompt(request)),
            _ => (SYSTEM_PROMPT, Self::primary_prompt(request)),
        };

        match self.ask(system, &user).await {
            Ok(decision) => {
                self.cache.insert(key, decision);
                metrics::LLM_ARBITER_TOTAL
                    .with_label_values(&[mode, if decision { "sim" } else { "nao" }])
                    .inc();
                tracing::debug!(
                    mode = mode,
                    decision = decision,
                    valor = request.valor,
                    "LLM arbiter decision"
                );
                decision
            }
            Err(e) => {
                metrics::LLM_ARBITER_TOTAL
                    .with_label_values(&[mode, "error"])
                    .inc();
                tracing::error!(mode = mode, "LLM arbiter failed, using safe default: {}", e);
                safe_default
            }
        }
    }

    /// Best-effort executive summary for the generate stage. Returns
    /// `None` when the oracle is disabled or fails; the search still
    /// completes without a summary.
    pub async fn generate_summary(
        &self,
        sector_or_terms: &str,
        total_filtered: usize,
        valor_total: f64,
        top_objetos: &[String],
        max_tokens: u32,
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let destaques = top_objetos
            .iter()
            .take(5)
            .map(|o| format!("- {}", o.chars().take(200).collect::<String>()))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Resuma em um parágrafo, em português, o resultado desta busca de \
             licitações.\nBusca: {}\nTotal de oportunidades: {}\nValor somado: R$ {:.2}\n\
             Destaques:\n{}",
            sector_or_terms, total_filtered, valor_total, destaques
        );

        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "temperature": 0.3,
        });

        let result = async {
            let response = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(self.api_key.as_deref().unwrap_or_default())
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            let payload: serde_json::Value = response.json().await?;
            anyhow::Ok(
                payload
                    .pointer("/choices/0/message/content")
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string()),
            )
        }
        .await;

        match result {
            Ok(summary) => summary.filter(|s| !s.is_empty()),
            Err(e) => {
                tracing::warn!("summary generation failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl RelevanceArbiter for LlmArbiter {
    async fn primary_match(&self, request: &ArbiterRequest) -> bool {
        // Safe default: reject the ambiguous bid.
        self.classify("primary", request, false).await
    }

    async fn recovery(&self, request: &ArbiterRequest) -> bool {
        // Safe default: do not recover.
        self.classify("recovery", request, false).await
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(level: PromptLevel) -> ArbiterRequest {
        ArbiterRequest {
            objeto: "Uniformes escolares diversos".into(),
            valor: 3_000_000.0,
            sector_name: Some("Vestuário e Uniformes".into()),
            custom_terms: None,
            prompt_level: level,
            rejection_reason: None,
            near_miss_info: None,
        }
    }

    #[tokio::test]
    async fn test_disabled_returns_safe_defaults() {
        let arbiter = LlmArbiter::for_tests("http://localhost:9", false);
        assert!(!arbiter.primary_match(&request(PromptLevel::Standard)).await);
        assert!(!arbiter.recovery(&request(PromptLevel::Standard)).await);
    }

    #[tokio::test]
    async fn test_oracle_error_returns_safe_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let arbiter = LlmArbiter::for_tests(&server.uri(), true);
        assert!(!arbiter.primary_match(&request(PromptLevel::Standard)).await);
    }

    #[tokio::test]
    async fn test_sim_reply_accepts_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "SIM"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let arbiter = LlmArbiter::for_tests(&server.uri(), true);
        let req = request(PromptLevel::Conservative);
        assert!(arbiter.primary_match(&req).await);
        // Second identical call must come from the cache.
        assert!(arbiter.primary_match(&req).await);
        assert_eq!(arbiter.cache_size(), 1);
    }

    #[tokio::test]
    async fn test_non_sim_reply_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "Talvez"}}]
            })))
            .mount(&server)
            .await;

        let arbiter = LlmArbiter::for_tests(&server.uri(), true);
        assert!(!arbiter.primary_match(&request(PromptLevel::Standard)).await);
    }

    #[test]
    fn test_cache_key_varies_by_prompt_level() {
        let a = LlmArbiter::cache_key("primary", &request(PromptLevel::Conservative));
        let b = LlmArbiter::cache_key("primary", &request(PromptLevel::Standard));
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_key_deterministic() {
        let a = LlmArbiter::cache_key("primary", &request(PromptLevel::Standard));
        let b = LlmArbiter::cache_key("primary", &request(PromptLevel::Standard));
        assert_eq!(a, b);
    }

    #[test]
    fn test_conservative_prompt_carries_examples() {
        let prompt = LlmArbiter::primary_prompt(&request(PromptLevel::Conservative));
        assert!(prompt.contains("EXEMPLOS"));
        let standard = LlmArbiter::primary_prompt(&request(PromptLevel::Standard));
        assert!(!standard.contains("EXEMPLOS"));
    }

    #[test]
    fn test_clear_cache() {
        let arbiter = LlmArbiter::for_tests("http://localhost:9", false);
        arbiter.cache.insert("k".into(), true);
        arbiter.clear_cache();
        assert_eq!(arbiter.cache_size(), 0);
    }
}
