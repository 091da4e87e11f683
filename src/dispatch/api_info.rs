//! Static API metadata served by the built-in `nvim_get_api_info`.

use rmpv::Value;

use crate::wire::{BUFFER_EXT_TYPE, TABPAGE_EXT_TYPE, WINDOW_EXT_TYPE};

/// Built-in method names, answered before the method table is consulted.
pub const API_INFO_METHODS: [&str; 2] = ["nvim_get_api_info", "vim_get_api_info"];

/// API level advertised to clients.
pub const API_LEVEL: u64 = 1;

pub fn is_api_info_method(method: &str) -> bool {
    API_INFO_METHODS.contains(&method)
}

fn entry(key: &str, value: Value) -> (Value, Value) {
    (Value::from(key), value)
}

fn version() -> Value {
    let part = |s: &str| s.parse::<u64>().unwrap_or(0);
    Value::Map(vec![
        entry("major", Value::from(part(env!("CARGO_PKG_VERSION_MAJOR")))),
        entry("minor", Value::from(part(env!("CARGO_PKG_VERSION_MINOR")))),
        entry("patch", Value::from(part(env!("CARGO_PKG_VERSION_PATCH")))),
        entry("api_level", Value::from(API_LEVEL)),
        entry("api_compatible", Value::from(0)),
        entry("api_prerelease", Value::from(false)),
    ])
}

fn handle_type(id: i8, prefix: &str) -> Value {
    Value::Map(vec![
        entry("id", Value::from(id)),
        entry("prefix", Value::from(prefix)),
    ])
}

fn function(name: &str) -> Value {
    Value::Map(vec![
        entry("name", Value::from(name)),
        entry("method", Value::from(false)),
        entry("since", Value::from(API_LEVEL)),
        entry("parameters", Value::Array(Vec::new())),
        entry("return_type", Value::from("Object")),
    ])
}

/// Build the API info map for a table exporting `functions`.
pub fn build_api_info(functions: &[String]) -> Value {
    let mut names: Vec<&str> = API_INFO_METHODS.to_vec();
    names.extend(functions.iter().map(String::as_str));

    Value::Map(vec![
        entry("version", version()),
        entry(
            "functions",
            Value::Array(names.into_iter().map(function).collect()),
        ),
        entry("ui_events", Value::Array(Vec::new())),
        entry(
            "types",
            Value::Map(vec![
                entry("Buffer", handle_type(BUFFER_EXT_TYPE, "nvim_buf_")),
                entry("Window", handle_type(WINDOW_EXT_TYPE, "nvim_win_")),
                entry("Tabpage", handle_type(TABPAGE_EXT_TYPE, "nvim_tabpage_")),
            ]),
        ),
        entry(
            "error_types",
            Value::Map(vec![
                entry("Exception", Value::Map(vec![entry("id", Value::from(0))])),
                entry("Validation", Value::Map(vec![entry("id", Value::from(1))])),
            ]),
        ),
    ])
}

/// Look up a key in a msgpack map value.
pub fn map_get<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_info_lists_types_and_functions() {
        let info = build_api_info(&["echo".to_string()]);

        let buffer = map_get(map_get(&info, "types").unwrap(), "Buffer").unwrap();
        assert_eq!(map_get(buffer, "id").and_then(Value::as_i64), Some(0));

        let names: Vec<&str> = map_get(&info, "functions")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .filter_map(|f| map_get(f, "name").and_then(Value::as_str))
            .collect();
        assert_eq!(names, vec!["nvim_get_api_info", "vim_get_api_info", "echo"]);

        let level = map_get(map_get(&info, "version").unwrap(), "api_level");
        assert_eq!(level.and_then(Value::as_u64), Some(API_LEVEL));
    }

    #[test]
    fn test_builtin_names() {
        assert!(is_api_info_method("nvim_get_api_info"));
        assert!(is_api_info_method("vim_get_api_info"));
        assert!(!is_api_info_method("nvim_get_var"));
    }
}
