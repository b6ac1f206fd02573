//! Static catalog of model sizes.
//!
//! Each size identifier belongs to exactly one architecture family and carries
//! that family's default hyperparameters.

use crate::error::{PlanError, PlanResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of architecture families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchitectureFamily {
    /// Striped Hyena convolution/attention hybrid.
    Hyena,
    /// Hybrid Mamba state-space model.
    Mamba,
}

impl ArchitectureFamily {
    pub const ALL: [Self; 2] = [Self::Hyena, Self::Mamba];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hyena => "hyena",
            Self::Mamba => "mamba",
        }
    }
}

impl fmt::Display for ArchitectureFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchitectureFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| format!("unknown architecture family `{s}` (expected hyena or mamba)"))
    }
}

/// Default hyperparameters for one catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BaseHyperparameters {
    pub num_layers: u32,
    pub hidden_size: u32,
    pub ffn_hidden_size: u32,
    pub num_attention_heads: u32,
    pub seq_length: u32,
    pub vocab_size: u32,
    pub hybrid_override_pattern: &'static str,
    pub recompute_num_layers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub size: &'static str,
    pub family: ArchitectureFamily,
    pub defaults: BaseHyperparameters,
}

const BYTE_VOCAB: u32 = 512;

const HYENA_TEST: BaseHyperparameters = BaseHyperparameters {
    num_layers: 4,
    hidden_size: 4096,
    ffn_hidden_size: 11008,
    num_attention_heads: 32,
    seq_length: 8192,
    vocab_size: BYTE_VOCAB,
    hybrid_override_pattern: "SDH*",
    recompute_num_layers: 2,
};

const HYENA_1B: BaseHyperparameters = BaseHyperparameters {
    num_layers: 25,
    hidden_size: 1920,
    ffn_hidden_size: 5120,
    num_attention_heads: 15,
    seq_length: 8192,
    vocab_size: BYTE_VOCAB,
    hybrid_override_pattern: "SDH*SDHSDH*SDHSDH*SDHSDH*",
    recompute_num_layers: 5,
};

const HYENA_7B: BaseHyperparameters = BaseHyperparameters {
    num_layers: 32,
    hidden_size: 4096,
    ffn_hidden_size: 11008,
    num_attention_heads: 32,
    seq_length: 8192,
    vocab_size: BYTE_VOCAB,
    hybrid_override_pattern: "SDH*SDHSDH*SDHSDH*SDHSDH*SDHSDH*",
    recompute_num_layers: 4,
};

const HYENA_40B: BaseHyperparameters = BaseHyperparameters {
    num_layers: 50,
    hidden_size: 8192,
    ffn_hidden_size: 21888,
    num_attention_heads: 64,
    seq_length: 8192,
    vocab_size: BYTE_VOCAB,
    hybrid_override_pattern: "SDH*SDHSDH*SDHSDH*SDHSDH*SDHSDH*SDH*SDHSDH*SDHSDH*",
    recompute_num_layers: 2,
};

const LONG_CONTEXT: u32 = 1_048_576;

const MAMBA_TEST: BaseHyperparameters = BaseHyperparameters {
    num_layers: 4,
    hidden_size: 1024,
    ffn_hidden_size: 4096,
    num_attention_heads: 8,
    seq_length: 8192,
    vocab_size: BYTE_VOCAB,
    hybrid_override_pattern: "M-M*",
    recompute_num_layers: 2,
};

const MAMBA_8B: BaseHyperparameters = BaseHyperparameters {
    num_layers: 52,
    hidden_size: 4096,
    ffn_hidden_size: 21504,
    num_attention_heads: 32,
    seq_length: 8192,
    vocab_size: BYTE_VOCAB,
    hybrid_override_pattern: "M-M-M-M*-M-M-M-M*-M-M-M-M*-M-M-M-M*-M-M-M-M*-M-M-M-M",
    recompute_num_layers: 4,
};

const fn hyena(size: &'static str, defaults: BaseHyperparameters) -> CatalogEntry {
    CatalogEntry { size, family: ArchitectureFamily::Hyena, defaults }
}

const fn mamba(size: &'static str, defaults: BaseHyperparameters) -> CatalogEntry {
    CatalogEntry { size, family: ArchitectureFamily::Mamba, defaults }
}

const fn long_context(defaults: BaseHyperparameters) -> BaseHyperparameters {
    BaseHyperparameters { seq_length: LONG_CONTEXT, ..defaults }
}

const BUILTIN: &[CatalogEntry] = &[
    hyena("test", HYENA_TEST),
    hyena("test_nv", HYENA_TEST),
    hyena("1b", HYENA_1B),
    hyena("1b_nv", HYENA_1B),
    hyena("7b", HYENA_7B),
    hyena("7b_nv", HYENA_7B),
    hyena("7b_arc_longcontext", long_context(HYENA_7B)),
    hyena("40b", HYENA_40B),
    hyena("40b_nv", HYENA_40B),
    hyena("40b_arc_longcontext", long_context(HYENA_40B)),
    mamba("hybrid_mamba_test", MAMBA_TEST),
    mamba("hybrid_mamba_8b", MAMBA_8B),
];

/// Lookup table from size identifier to family and defaults.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    #[must_use]
    pub fn builtin() -> Self {
        Self { entries: BUILTIN.to_vec() }
    }

    #[must_use]
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Resolve a size identifier to its single catalog entry.
    pub fn lookup(&self, identifier: &str) -> PlanResult<&CatalogEntry> {
        let mut matches = self.entries.iter().filter(|e| e.size == identifier);
        let Some(first) = matches.next() else {
            return Err(PlanError::UnknownSizeIdentifier { identifier: identifier.to_string() });
        };

        let rest: Vec<&CatalogEntry> = matches.collect();
        if !rest.is_empty() {
            let mut families: Vec<String> = std::iter::once(first)
                .chain(rest)
                .map(|e| e.family.to_string())
                .collect();
            families.sort();
            return Err(PlanError::AmbiguousSizeIdentifier {
                identifier: identifier.to_string(),
                families,
            });
        }

        Ok(first)
    }

    /// Check that no identifier is claimed twice.
    pub fn validate(&self) -> PlanResult<()> {
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in &self.entries {
            *seen.entry(entry.size).or_default() += 1;
        }
        if let Some((identifier, _)) = seen.into_iter().find(|(_, count)| *count > 1) {
            self.lookup(identifier)?;
        }
        Ok(())
    }

    /// Size identifiers, grouped by family in catalog order.
    #[must_use]
    pub fn sizes_for(&self, family: ArchitectureFamily) -> Vec<&'static str> {
        self.entries.iter().filter(|e| e.family == family).map(|e| e.size).collect()
    }
}
