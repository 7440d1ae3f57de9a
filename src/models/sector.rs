//! Sector catalog: keyword sets, exclusion lists, and synonym dictionaries.
//!
//! Each sector is a product category with the canonical keywords used by
//! the lexical filter, optional exclusion keywords, and a synonym map
//! consulted by the recovery layer when the lexical pass comes up short.

use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Sector {
    pub id: &'static str,
    pub name: &'static str,
    pub keywords: Vec<&'static str>,
    pub exclusions: Vec<&'static str>,
    /// canonical keyword → accepted synonyms.
    pub synonyms: HashMap<&'static str, Vec<&'static str>>,
}

static SECTORS: Lazy<Vec<Sector>> = Lazy::new(|| {
    vec![
        Sector {
            id: "vestuario",
            name: "Vestuário e Uniformes",
            keywords: vec![
                "uniforme",
                "farda",
                "vestuario",
                "camisa",
                "calca",
                "jaleco",
                "colete",
            ],
            exclusions: vec!["avental hospitalar", "epi medico"],
            synonyms: HashMap::from([
                ("uniforme", vec!["fardamento", "vestimenta", "indumentaria"]),
                ("farda", vec!["fardamento"]),
                ("jaleco", vec!["guarda-po"]),
            ]),
        },
        Sector {
            id: "facilities",
            name: "Facilities e Limpeza",
            keywords: vec![
                "limpeza",
                "conservacao",
                "higienizacao",
                "portaria",
                "vigilancia",
                "jardinagem",
            ],
            exclusions: vec!["limpeza urbana", "coleta de lixo"],
            synonyms: HashMap::from([
                ("limpeza", vec!["asseio", "zeladoria"]),
                ("conservacao", vec!["manutencao predial"]),
                ("vigilancia", vec!["seguranca patrimonial"]),
            ]),
        },
        Sector {
            id: "informatica",
            name: "Informática e Tecnologia",
            keywords: vec![
                "software",
                "hardware",
                "computador",
                "notebook",
                "servidor",
                "rede",
                "licenca",
            ],
            exclusions: vec!["servidor publico", "servidores publicos"],
            synonyms: HashMap::from([
                ("computador", vec!["microcomputador", "desktop", "estacao de trabalho"]),
                ("servidor", vec!["datacenter", "storage"]),
                ("rede", vec!["switch", "roteador", "cabeamento"]),
            ]),
        },
        Sector {
            id: "alimentacao",
            name: "Alimentação e Merenda",
            keywords: vec![
                "merenda",
                "alimentacao",
                "alimento",
                "genero alimenticio",
                "refeicao",
                "cesta basica",
            ],
            exclusions: vec!["racao animal"],
            synonyms: HashMap::from([
                ("merenda", vec!["alimentacao escolar"]),
                ("refeicao", vec!["almoco", "jantar", "coffee break"]),
            ]),
        },
        Sector {
            id: "saude",
            name: "Saúde e Medicamentos",
            keywords: vec![
                "medicamento",
                "farmaco",
                "insumo hospitalar",
                "material medico",
                "equipamento hospitalar",
            ],
            exclusions: vec!["plano de saude"],
            synonyms: HashMap::from([
                ("medicamento", vec!["remedio", "farmaco"]),
                ("insumo hospitalar", vec!["material hospitalar"]),
            ]),
        },
        Sector {
            id: "engenharia",
            name: "Engenharia e Obras",
            keywords: vec![
                "obra",
                "construcao",
                "reforma",
                "pavimentacao",
                "engenharia",
                "drenagem",
            ],
            exclusions: vec![],
            synonyms: HashMap::from([
                ("obra", vec!["edificacao"]),
                ("pavimentacao", vec!["recapeamento", "asfaltamento"]),
            ]),
        },
    ]
});

pub fn get_sector(id: &str) -> Option<&'static Sector> {
    SECTORS.iter().find(|s| s.id == id)
}

pub fn all_sectors() -> &'static [Sector] {
    &SECTORS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sector_lookup() {
        let s = get_sector("vestuario").unwrap();
        assert_eq!(s.name, "Vestuário e Uniformes");
        assert!(s.keywords.contains(&"uniforme"));
    }

    #[test]
    fn test_unknown_sector_is_none() {
        assert!(get_sector("nonexistent").is_none());
    }

    #[test]
    fn test_synonyms_reference_canonical_keywords() {
        for sector in all_sectors() {
            for canonical in sector.synonyms.keys() {
                assert!(
                    sector.keywords.contains(canonical),
                    "sector {}: synonym key {:?} is not a canonical keyword",
                    sector.id,
                    canonical
                );
            }
        }
    }
}
