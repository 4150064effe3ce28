//! Model resolution and API-key sealing.
//!
//! Resolution order, first hit wins:
//! 1. task labels with `forceOverrideBotModel` + `modelId`
//! 2. bot `bindModel` (scope chosen by `bindModelType`)
//! 3. task label `modelId` without the force flag
//! 4. bot's static `modelRef`
//!
//! Model API keys are stored sealed; they are opened only here, while the
//! dispatch payload (or chat request) is being assembled.

use crate::shell::ModelParams;
use crate::store::resources::{BindModelScope, BotSpec, ModelSpec, ResourceSpec, TaskLabels};
use crate::store::{Database, ResourceKind, PUBLIC_OWNER};
use std::hash::{Hash, Hasher};

/// Resolve the model a subtask should run with.
pub fn resolve_model(
    db: &Database,
    sealing_key: &str,
    owner_id: i64,
    labels: &TaskLabels,
    bot: Option<&BotSpec>,
) -> Option<ModelParams> {
    if labels.force_override_bot_model {
        if let Some(name) = &labels.model_id {
            if let Some(params) = lookup(db, sealing_key, owner_id, name, "default") {
                return Some(params);
            }
        }
    }

    if let Some(bot) = bot {
        if let Some(bind) = bot.bind_model.as_deref().filter(|b| !b.is_empty()) {
            let hit = match bot.bind_model_type {
                BindModelScope::Public => {
                    lookup_scoped(db, sealing_key, PUBLIC_OWNER, bind, "default")
                }
                BindModelScope::User => lookup(db, sealing_key, owner_id, bind, "default"),
                BindModelScope::Group => lookup(db, sealing_key, owner_id, bind, "group"),
            };
            if let Some(params) = hit {
                return Some(params);
            }
        }
    }

    if let Some(name) = &labels.model_id {
        if let Some(params) = lookup(db, sealing_key, owner_id, name, "default") {
            return Some(params);
        }
    }

    let model_ref = bot.and_then(|b| b.model_ref.as_ref())?;
    lookup(db, sealing_key, owner_id, &model_ref.name, &model_ref.namespace)
}

/// User-scoped lookup with public fallback.
fn lookup(
    db: &Database,
    sealing_key: &str,
    owner_id: i64,
    name: &str,
    namespace: &str,
) -> Option<ModelParams> {
    let row = db
        .get_with_fallback(owner_id, ResourceKind::Model, name, namespace)
        .ok()
        .flatten()?;
    into_params(sealing_key, row.spec().ok()?)
}

/// Exact-scope lookup without fallback.
fn lookup_scoped(
    db: &Database,
    sealing_key: &str,
    owner_id: i64,
    name: &str,
    namespace: &str,
) -> Option<ModelParams> {
    let row = db
        .get_by_name(owner_id, ResourceKind::Model, name, namespace)
        .ok()
        .flatten()?;
    into_params(sealing_key, row.spec().ok()?)
}

fn into_params(sealing_key: &str, spec: ResourceSpec) -> Option<ModelParams> {
    let ResourceSpec::Model(model) = spec else {
        return None;
    };
    let ModelSpec {
        model_name,
        provider,
        base_url,
        api_key,
        config: _,
    } = model;
    Some(ModelParams {
        model_name,
        provider,
        base_url,
        api_key: api_key.map(|sealed| unseal(sealing_key, &sealed)),
    })
}

// ============================================================================
// API-key sealing
// ============================================================================

const SEALED_PREFIX: &str = "sealed:";

/// Seal a plaintext key for storage. Keyed keystream XOR, hex-encoded;
/// the goal is opacity at rest, with the sealing key held in deployment
/// config rather than the database.
pub fn seal(sealing_key: &str, plaintext: &str) -> String {
    let bytes: Vec<u8> = plaintext
        .bytes()
        .zip(keystream(sealing_key))
        .map(|(b, k)| b ^ k)
        .collect();
    let mut out = String::with_capacity(SEALED_PREFIX.len() + bytes.len() * 2);
    out.push_str(SEALED_PREFIX);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Open a sealed key. Values without the sealed prefix are returned as-is
/// so hand-provisioned configs keep working.
pub fn unseal(sealing_key: &str, stored: &str) -> String {
    let Some(hex) = stored.strip_prefix(SEALED_PREFIX) else {
        return stored.to_string();
    };
    let Some(bytes) = decode_hex(hex) else {
        return String::new();
    };
    bytes
        .into_iter()
        .zip(keystream(sealing_key))
        .map(|(b, k)| char::from(b ^ k))
        .collect()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Infinite keyed byte stream derived from the sealing key.
fn keystream(key: &str) -> impl Iterator<Item = u8> + '_ {
    (0u64..).flat_map(move |counter| {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        counter.hash(&mut hasher);
        hasher.finish().to_le_bytes()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::resources::ResourceRef;

    const KEY: &str = "unit-test-sealing-key";

    fn model_spec(name: &str, api_key: Option<String>) -> ResourceSpec {
        ResourceSpec::Model(ModelSpec {
            model_name: name.to_string(),
            provider: None,
            base_url: None,
            api_key,
            config: serde_json::Value::Null,
        })
    }

    fn bot(bind_model: Option<&str>, model_ref: Option<&str>) -> BotSpec {
        BotSpec {
            ghost: ResourceRef::new("ghost"),
            shell: ResourceRef::new("shell"),
            model_ref: model_ref.map(ResourceRef::new),
            bind_model: bind_model.map(str::to_string),
            bind_model_type: BindModelScope::Public,
            agent_config: serde_json::Value::Null,
            base_image: None,
        }
    }

    #[test]
    fn seal_roundtrip() {
        let sealed = seal(KEY, "sk-secret-key");
        assert!(sealed.starts_with(SEALED_PREFIX));
        assert_ne!(sealed, "sk-secret-key");
        assert_eq!(unseal(KEY, &sealed), "sk-secret-key");
    }

    #[test]
    fn unsealed_values_pass_through() {
        assert_eq!(unseal(KEY, "plain-key"), "plain-key");
    }

    #[test]
    fn force_override_wins_over_bind_model() {
        let db = Database::open_in_memory().unwrap();
        db.create_resource(PUBLIC_OWNER, "forced", "default", &model_spec("forced-model", None))
            .unwrap();
        db.create_resource(PUBLIC_OWNER, "bound", "default", &model_spec("bound-model", None))
            .unwrap();

        let labels = TaskLabels {
            model_id: Some("forced".into()),
            force_override_bot_model: true,
            ..TaskLabels::default()
        };
        let resolved =
            resolve_model(&db, KEY, 7, &labels, Some(&bot(Some("bound"), None))).unwrap();
        assert_eq!(resolved.model_name, "forced-model");
    }

    #[test]
    fn bind_model_wins_over_plain_label() {
        let db = Database::open_in_memory().unwrap();
        db.create_resource(PUBLIC_OWNER, "labelled", "default", &model_spec("labelled-model", None))
            .unwrap();
        db.create_resource(PUBLIC_OWNER, "bound", "default", &model_spec("bound-model", None))
            .unwrap();

        let labels = TaskLabels {
            model_id: Some("labelled".into()),
            force_override_bot_model: false,
            ..TaskLabels::default()
        };
        let resolved =
            resolve_model(&db, KEY, 7, &labels, Some(&bot(Some("bound"), None))).unwrap();
        assert_eq!(resolved.model_name, "bound-model");
    }

    #[test]
    fn falls_back_to_bot_model_ref() {
        let db = Database::open_in_memory().unwrap();
        db.create_resource(PUBLIC_OWNER, "static", "default", &model_spec("static-model", None))
            .unwrap();

        let resolved = resolve_model(
            &db,
            KEY,
            7,
            &TaskLabels::default(),
            Some(&bot(None, Some("static"))),
        )
        .unwrap();
        assert_eq!(resolved.model_name, "static-model");
    }

    #[test]
    fn api_key_is_opened_during_resolution() {
        let db = Database::open_in_memory().unwrap();
        let sealed = seal(KEY, "sk-live");
        db.create_resource(PUBLIC_OWNER, "m", "default", &model_spec("m1", Some(sealed)))
            .unwrap();

        let resolved = resolve_model(
            &db,
            KEY,
            7,
            &TaskLabels::default(),
            Some(&bot(None, Some("m"))),
        )
        .unwrap();
        assert_eq!(resolved.api_key.as_deref(), Some("sk-live"));
    }

    #[test]
    fn no_sources_resolves_to_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(resolve_model(&db, KEY, 7, &TaskLabels::default(), None).is_none());
    }
}
