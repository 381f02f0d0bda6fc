use std::sync::LazyLock;

use regex::Regex;

static MODULE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[_a-zA-Z0-9]*::").expect("valid module path pattern"));

/// The type name of `T` with every module path stripped, used to name workers
/// and jobs in the logs.
pub fn short_name<T: ?Sized>() -> String {
    abs_to_rel_paths(std::any::type_name::<T>())
}

fn abs_to_rel_paths(s: &str) -> String {
    MODULE_PATH.replace_all(s, "").into()
}
