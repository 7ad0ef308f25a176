//! Scoring configuration: weighted criteria and hard eligibility filters.
//!
//! Both structures are part of the analysis context and are hashed through
//! [`crate::fingerprint::hash_structured`], so every recognised field takes
//! part in the cache key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A leaf criterion inside a main criterion group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCriterion {
    pub key: String,
    pub name: String,
    pub weight: u32,
}

/// A top-level scoring criterion. Its weight is either given directly or is
/// the sum of its children.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainCriterion {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SubCriterion>,
}

impl MainCriterion {
    pub fn total_weight(&self) -> u32 {
        if self.children.is_empty() {
            self.weight.unwrap_or(0)
        } else {
            self.children.iter().map(|c| c.weight).sum()
        }
    }
}

/// Criterion key (e.g. `"experience"`) to its definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightCriteria(pub BTreeMap<String, MainCriterion>);

impl WeightCriteria {
    pub fn insert(&mut self, key: impl Into<String>, criterion: MainCriterion) {
        self.0.insert(key.into(), criterion);
    }

    /// Sum of every criterion's effective weight; a well-formed set totals 100.
    pub fn total_weight(&self) -> u32 {
        self.0.values().map(MainCriterion::total_weight).sum()
    }

    /// `"name: weight%"` lines, the compact form handed to the analyzer prompt.
    pub fn compact_summary(&self) -> String {
        self.0
            .values()
            .map(|c| format!("{}: {}%", c.name, c.total_weight()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Hard eligibility filters. Empty strings mean "not set".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HardFilters {
    pub location: String,
    pub min_exp: String,
    pub seniority: String,
    pub education: String,
    pub industry: String,
    pub language: String,
    pub language_level: String,
    pub certificates: String,
    pub salary_min: String,
    pub salary_max: String,
    pub work_format: String,
    pub contract_type: String,
    pub location_mandatory: bool,
    pub min_exp_mandatory: bool,
    pub seniority_mandatory: bool,
    pub education_mandatory: bool,
    pub contact_mandatory: bool,
    pub industry_mandatory: bool,
    pub language_mandatory: bool,
    pub certificates_mandatory: bool,
    pub salary_mandatory: bool,
    pub work_format_mandatory: bool,
    pub contract_type_mandatory: bool,
}

impl Default for HardFilters {
    fn default() -> Self {
        Self {
            location: String::new(),
            min_exp: String::new(),
            seniority: String::new(),
            education: String::new(),
            industry: String::new(),
            language: String::new(),
            language_level: String::new(),
            certificates: String::new(),
            salary_min: String::new(),
            salary_max: String::new(),
            work_format: String::new(),
            contract_type: String::new(),
            location_mandatory: true,
            min_exp_mandatory: true,
            seniority_mandatory: true,
            education_mandatory: false,
            contact_mandatory: false,
            industry_mandatory: true,
            language_mandatory: false,
            certificates_mandatory: false,
            salary_mandatory: false,
            work_format_mandatory: false,
            contract_type_mandatory: false,
        }
    }
}

impl HardFilters {
    /// Names of the filters that are both mandatory and filled in.
    pub fn mandatory_filters(&self) -> Vec<&'static str> {
        let salary_set = !self.salary_min.trim().is_empty() || !self.salary_max.trim().is_empty();
        let language_set = !self.language.trim().is_empty();
        [
            ("location", self.location_mandatory, !self.location.trim().is_empty()),
            ("minExp", self.min_exp_mandatory, !self.min_exp.trim().is_empty()),
            ("seniority", self.seniority_mandatory, !self.seniority.trim().is_empty()),
            ("education", self.education_mandatory, !self.education.trim().is_empty()),
            ("industry", self.industry_mandatory, !self.industry.trim().is_empty()),
            ("language", self.language_mandatory, language_set),
            ("certificates", self.certificates_mandatory, !self.certificates.trim().is_empty()),
            ("salary", self.salary_mandatory, salary_set),
            ("workFormat", self.work_format_mandatory, !self.work_format.trim().is_empty()),
            ("contractType", self.contract_type_mandatory, !self.contract_type.trim().is_empty()),
        ]
        .into_iter()
        .filter(|(_, mandatory, set)| *mandatory && *set)
        .map(|(name, _, _)| name)
        .collect()
    }
}
