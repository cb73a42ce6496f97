//! Run identifiers, auth tokens, and human-friendly agent names

use crate::{CoreError, Result};
use rand::seq::SliceRandom;
use rand::Rng;

/// Prefix for all run ids
pub const RUN_ID_PREFIX: &str = "run_";

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crimson", "deft", "eager", "fleet", "gentle",
    "keen", "lively", "lucid", "mellow", "nimble", "quiet", "rapid", "sly", "steady", "swift",
    "tidy", "vivid", "wry", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "bison", "crane", "dingo", "falcon", "gecko", "heron", "ibex", "jackal", "koala",
    "lemur", "lynx", "marmot", "newt", "ocelot", "otter", "panda", "quokka", "raven", "shrew",
    "tapir", "urchin", "vole", "wombat",
];

/// Generate a new run id: `run_` plus 12 random hex characters.
///
/// Uniqueness is probabilistic; 48 bits of randomness is enough that
/// collisions are not checked.
pub fn generate_run_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill(&mut bytes);
    format!("{}{}", RUN_ID_PREFIX, hex::encode(bytes))
}

/// Generate a 32-byte bearer token for proxies that must bind to all
/// interfaces
pub fn generate_auth_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Pick a random adjective-animal name
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap();
    let animal = ANIMALS.choose(&mut rng).unwrap();
    format!("{}-{}", adjective, animal)
}

/// Allocate a run name.
///
/// An explicit name fails immediately if taken. Otherwise three random
/// names are tried before falling back to a random name suffixed with the
/// tail of a fresh id.
pub fn allocate_name<F>(explicit: Option<&str>, is_taken: F) -> Result<String>
where
    F: Fn(&str) -> bool,
{
    if let Some(name) = explicit {
        if is_taken(name) {
            return Err(CoreError::NameConflict(name.to_string()));
        }
        return Ok(name.to_string());
    }

    for _ in 0..3 {
        let candidate = random_name();
        if !is_taken(&candidate) {
            return Ok(candidate);
        }
    }

    let id = generate_run_id();
    let suffix = &id[id.len() - 4..];
    Ok(format!("{}-{}", random_name(), suffix))
}

/// Sanitize a user-supplied name for container/DNS usage
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let mut result = String::new();
    let mut last_was_hyphen = true;
    for c in sanitized.chars() {
        if c == '-' {
            if !last_was_hyphen {
                result.push(c);
            }
            last_was_hyphen = true;
        } else {
            result.push(c);
            last_was_hyphen = false;
        }
    }

    if result.ends_with('-') {
        result.pop();
    }

    if result.is_empty() {
        "agent".to_string()
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_run_id_shape() {
        let id = generate_run_id();
        assert!(id.starts_with("run_"));
        assert_eq!(id.len(), 4 + 12);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_run_ids_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_run_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_auth_token_is_32_bytes_hex() {
        let token = generate_auth_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_explicit_name_conflict() {
        let result = allocate_name(Some("agent-a"), |n| n == "agent-a");
        assert!(matches!(result, Err(CoreError::NameConflict(_))));
    }

    #[test]
    fn test_explicit_name_free() {
        let name = allocate_name(Some("agent-a"), |_| false).unwrap();
        assert_eq!(name, "agent-a");
    }

    #[test]
    fn test_random_name_avoids_taken() {
        let name = allocate_name(None, |_| false).unwrap();
        assert!(name.contains('-'));
    }

    #[test]
    fn test_all_collisions_fall_back_to_suffixed_name() {
        // Every adjective-animal pick is "taken", so the allocator must
        // append an id suffix, which the predicate does not match.
        let name = allocate_name(None, |n| {
            ANIMALS.iter().any(|a| n.ends_with(a))
        })
        .unwrap();
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My Agent!"), "my-agent");
        assert_eq!(sanitize_name("--weird--"), "weird");
        assert_eq!(sanitize_name("***"), "agent");
    }
}
