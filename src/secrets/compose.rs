use serde_yaml::{Mapping, Value};

/// Declare `keys` as build secrets on every service that has a `build` section
/// and source each one from the environment at the top level.
///
/// A bare-string `build: ./dir` is normalised to `build: { context: ./dir }`.
/// Existing `build.secrets` and top-level `secrets` entries are kept.
pub fn inject_into_compose(manifest: &mut Value, keys: &[&str]) {
    if keys.is_empty() {
        return;
    }

    if let Some(services) = manifest.get_mut("services").and_then(Value::as_mapping_mut) {
        for (_, service) in services.iter_mut() {
            let Some(service) = service.as_mapping_mut() else {
                continue;
            };
            let Some(build) = service.get_mut("build") else {
                continue;
            };

            if let Value::String(context) = build {
                let mut normalized = Mapping::new();
                normalized.insert("context".into(), Value::String(context.clone()));
                *build = Value::Mapping(normalized);
            }

            let Some(build) = build.as_mapping_mut() else {
                continue;
            };
            let secrets = build
                .entry("secrets".into())
                .or_insert_with(|| Value::Sequence(Vec::new()));
            if !secrets.is_sequence() {
                *secrets = Value::Sequence(Vec::new());
            }
            if let Some(list) = secrets.as_sequence_mut() {
                for key in keys {
                    let value = Value::String(key.to_string());
                    if !list.contains(&value) {
                        list.push(value);
                    }
                }
            }
        }
    }

    let Some(root) = manifest.as_mapping_mut() else {
        return;
    };
    let top = root
        .entry("secrets".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !top.is_mapping() {
        *top = Value::Mapping(Mapping::new());
    }
    if let Some(top) = top.as_mapping_mut() {
        for key in keys {
            let name = Value::String(key.to_string());
            if top.contains_key(&name) {
                continue;
            }
            let mut source = Mapping::new();
            source.insert("environment".into(), Value::String(key.to_string()));
            top.insert(name, Value::Mapping(source));
        }
    }
}
