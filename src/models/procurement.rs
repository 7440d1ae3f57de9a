//! Unified procurement record and source metadata.
//!
//! Every adapter normalizes its upstream payload into `UnifiedProcurement`.
//! The record is created once by the adapter and flows read-only through
//! dedup, filtering and ordering until it is serialized into the result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Optional capabilities a source may support server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCapability {
    FilterByUf,
    FilterByValue,
    FilterByKeyword,
    Pagination,
    DateRange,
    RealTime,
}

/// Static metadata describing a procurement source.
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    pub name: &'static str,
    pub code: &'static str,
    pub base_url: String,
    pub capabilities: HashSet<SourceCapability>,
    /// Max sustained requests per second the upstream tolerates.
    pub rate_limit_rps: f64,
    pub typical_response_ms: u64,
    /// Dedup tie-breaking priority. Lower wins.
    pub priority: u32,
}

/// Canonical procurement record shared by the whole pipeline.
///
/// `raw_data` carries the original upstream payload for debugging only;
/// it is excluded from equality and must never be logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedProcurement {
    pub source_id: String,
    pub source_name: String,
    pub dedup_key: String,

    pub objeto: String,
    pub valor_estimado: f64,
    pub orgao: String,
    pub cnpj_orgao: String,
    pub uf: String,
    pub municipio: String,

    pub data_publicacao: Option<DateTime<Utc>>,
    pub data_abertura: Option<DateTime<Utc>>,
    pub data_encerramento: Option<DateTime<Utc>>,

    pub numero_edital: String,
    pub ano: String,
    pub modalidade: String,
    pub situacao: String,
    pub esfera: String,
    pub poder: String,

    pub link_edital: String,
    pub link_portal: String,

    pub fetched_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<serde_json::Value>,
}

impl PartialEq for UnifiedProcurement {
    fn eq(&self, other: &Self) -> bool {
        self.source_id == other.source_id
            && self.source_name == other.source_name
            && self.dedup_key == other.dedup_key
    }
}

/// Builder-style input for `UnifiedProcurement::new`. Adapters fill the
/// fields they can extract; normalization happens in one pass.
#[derive(Debug, Default, Clone)]
pub struct ProcurementFields {
    pub source_id: String,
    pub source_name: String,
    pub dedup_key: Option<String>,
    pub objeto: String,
    pub valor_estimado: f64,
    pub orgao: String,
    pub cnpj_orgao: String,
    pub uf: String,
    pub municipio: String,
    pub data_publicacao: Option<DateTime<Utc>>,
    pub data_abertura: Option<DateTime<Utc>>,
    pub data_encerramento: Option<DateTime<Utc>>,
    pub numero_edital: String,
    pub ano: String,
    pub modalidade: String,
    pub situacao: String,
    pub esfera: String,
    pub poder: String,
    pub link_edital: String,
    pub link_portal: String,
    pub raw_data: Option<serde_json::Value>,
}

impl UnifiedProcurement {
    /// Validate and normalize in one pass.
    ///
    /// Invariants enforced here: `uf` is two upper-case letters or empty,
    /// `valor_estimado >= 0`, whitespace is collapsed in `objeto`, and
    /// `dedup_key` is derived deterministically when not provided.
    pub fn new(fields: ProcurementFields) -> Self {
        let uf = normalize_uf(&fields.uf);
        let objeto = collapse_whitespace(&fields.objeto);
        let valor_estimado = fields.valor_estimado.max(0.0);

        let dedup_key = match fields.dedup_key {
            Some(k) if !k.is_empty() => k,
            _ => derive_dedup_key(
                &fields.cnpj_orgao,
                &fields.numero_edital,
                &fields.ano,
                &objeto,
                valor_estimado,
            ),
        };

        Self {
            source_id: fields.source_id,
            source_name: fields.source_name,
            dedup_key,
            objeto,
            valor_estimado,
            orgao: fields.orgao.trim().to_string(),
            cnpj_orgao: fields.cnpj_orgao.trim().to_string(),
            uf,
            municipio: fields.municipio.trim().to_string(),
            data_publicacao: fields.data_publicacao,
            data_abertura: fields.data_abertura,
            data_encerramento: fields.data_encerramento,
            numero_edital: fields.numero_edital.trim().to_string(),
            ano: fields.ano.trim().to_string(),
            modalidade: fields.modalidade.trim().to_string(),
            situacao: fields.situacao.trim().to_string(),
            esfera: fields.esfera.trim().to_string(),
            poder: fields.poder.trim().to_string(),
            link_edital: fields.link_edital.trim().to_string(),
            link_portal: fields.link_portal.trim().to_string(),
            fetched_at: Utc::now(),
            raw_data: fields.raw_data,
        }
    }

    pub fn has_dedup_key(&self) -> bool {
        !self.dedup_key.is_empty()
    }
}

/// Derive the stable dedup key used across sources.
///
/// Primary form: `digits(cnpj):numero_edital:ano`. When edital number or
/// year are missing, falls back to
/// `digits(cnpj):md5(normalized_objeto)[..12]:valor_as_int`.
pub fn derive_dedup_key(
    cnpj: &str,
    numero_edital: &str,
    ano: &str,
    objeto: &str,
    valor: f64,
) -> String {
    let cnpj_digits = digits_only(cnpj);
    let numero = numero_edital.trim();
    let ano = ano.trim();

    if !numero.is_empty() && !ano.is_empty() {
        return format!("{}:{}:{}", cnpj_digits, numero, ano);
    }

    let normalized = collapse_whitespace(objeto).to_lowercase();
    let digest = format!("{:x}", md5::compute(normalized.as_bytes()));
    format!("{}:{}:{}", cnpj_digits, &digest[..12], valor as i64)
}

/// Keep only ASCII digits (CNPJs arrive formatted as `00.000.000/0001-00`).
pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_uf(uf: &str) -> String {
    let upper = uf.trim().to_uppercase();
    if upper.len() == 2 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
        upper
    } else {
        String::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn base_fields() -> ProcurementFields {
        ProcurementFields {
            source_id: "abc-1".into(),
            source_name: "PNCP".into(),
            objeto: "Uniformes   escolares \n diversos".into(),
            valor_estimado: 1000.0,
            cnpj_orgao: "00.000.000/0001-00".into(),
            numero_edital: "123/2026".into(),
            ano: "2026".into(),
            uf: "sp".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalizes_uf_and_whitespace() {
        let rec = UnifiedProcurement::new(base_fields());
        assert_eq!(rec.uf, "SP");
        assert_eq!(rec.objeto, "Uniformes escolares diversos");
    }

    #[test]
    fn test_invalid_uf_becomes_empty() {
        let mut f = base_fields();
        f.uf = "São Paulo".into();
        let rec = UnifiedProcurement::new(f);
        assert_eq!(rec.uf, "");
    }

    #[test]
    fn test_dedup_key_primary_form() {
        let rec = UnifiedProcurement::new(base_fields());
        assert_eq!(rec.dedup_key, "00000000000100:123/2026:2026");
    }

    #[test]
    fn test_dedup_key_fallback_is_deterministic() {
        let mut f = base_fields();
        f.numero_edital = String::new();
        let a = UnifiedProcurement::new(f.clone());
        let b = UnifiedProcurement::new(f);
        assert_eq!(a.dedup_key, b.dedup_key);
        assert!(a.dedup_key.starts_with("00000000000100:"));
        assert!(a.dedup_key.ends_with(":1000"));
    }

    #[test]
    fn test_dedup_key_fallback_insensitive_to_spacing() {
        let mut f1 = base_fields();
        f1.ano = String::new();
        f1.objeto = "Uniformes escolares".into();
        let mut f2 = f1.clone();
        f2.objeto = "  Uniformes \t ESCOLARES ".into();
        assert_eq!(
            UnifiedProcurement::new(f1).dedup_key,
            UnifiedProcurement::new(f2).dedup_key
        );
    }

    #[test]
    fn test_provided_dedup_key_wins() {
        let mut f = base_fields();
        f.dedup_key = Some("custom-key".into());
        assert_eq!(UnifiedProcurement::new(f).dedup_key, "custom-key");
    }

    #[test]
    fn test_negative_value_clamped() {
        let mut f = base_fields();
        f.valor_estimado = -5.0;
        assert_eq!(UnifiedProcurement::new(f).valor_estimado, 0.0);
    }
}
