//! Queue-group placeholder resolution.
//!
//! Queue group names may embed deployment identity so every pod lands in
//! its own group (or shares one, as desired). Resolution is purely lexical
//! and case-sensitive; it happens once, at listener startup.
//!
//! | Placeholder      | Resolves to                                        |
//! |------------------|----------------------------------------------------|
//! | `{POD_NAME}`     | env `POD_NAME`, else `HOSTNAME`, else the DNS name |
//! | `{HOSTNAME}`     | env `HOSTNAME`, else the DNS name                  |
//! | `{MACHINE_NAME}` | the host's DNS name                                |
//! | `{ENV:NAME}`     | env `NAME`, or the empty string when unset         |

use std::env;

const ENV_PREFIX: &str = "ENV:";

/// Expand all placeholders in a queue group name.
///
/// Unknown placeholders are left verbatim; multiple occurrences are all
/// expanded.
pub fn resolve_queue_group(name: &str) -> String {
    let mut resolved = String::with_capacity(name.len());
    let mut rest = name;

    while let Some(open) = rest.find('{') {
        let (before, from_open) = rest.split_at(open);
        resolved.push_str(before);

        match from_open.find('}') {
            Some(close) => {
                let key = &from_open[1..close];
                match expand(key) {
                    Some(value) => resolved.push_str(&value),
                    None => resolved.push_str(&from_open[..=close]),
                }
                rest = &from_open[close + 1..];
            }
            None => {
                resolved.push_str(from_open);
                return resolved;
            }
        }
    }

    resolved.push_str(rest);
    resolved
}

fn expand(key: &str) -> Option<String> {
    if let Some(var) = key.strip_prefix(ENV_PREFIX) {
        return Some(env::var(var).unwrap_or_default());
    }
    match key {
        "POD_NAME" => Some(
            env::var("POD_NAME")
                .or_else(|_| env::var("HOSTNAME"))
                .unwrap_or_else(|_| machine_name()),
        ),
        "HOSTNAME" => Some(env::var("HOSTNAME").unwrap_or_else(|_| machine_name())),
        "MACHINE_NAME" => Some(machine_name()),
        _ => None,
    }
}

/// The host's DNS name.
fn machine_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
