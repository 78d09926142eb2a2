// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata (context windows, output caps, token rates)
//! for the models the fabric routes by default.

use serde::Deserialize;

use crate::types::ModelInfo;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelInfo>,
}

/// All entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelInfo> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile =
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

/// Entries belonging to one provider.
pub fn for_provider(provider: &str) -> Vec<ModelInfo> {
    static_catalog()
        .into_iter()
        .filter(|m| m.provider == provider)
        .collect()
}

/// Look up a model by id.  Returns `None` for unknown ids.
pub fn lookup(model_id: &str) -> Option<ModelInfo> {
    static_catalog().into_iter().find(|m| m.id == model_id)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
