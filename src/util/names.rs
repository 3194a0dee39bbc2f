//! Random human-readable names for unnamed containers.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "agile", "bold", "brave", "calm", "clever", "eager", "gentle", "happy",
    "jolly", "keen", "lively", "mellow", "nimble", "proud", "quiet", "rapid",
    "sharp", "sturdy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beaver", "condor", "falcon", "gibbon", "heron", "jackal",
    "lemur", "lynx", "marmot", "meerkat", "ocelot", "osprey", "otter",
    "panda", "puffin", "quokka", "raven", "stoat", "wombat",
];

/// `adjective_noun`, docker-style. Uniqueness is enforced by the caller at
/// create time, not here.
pub fn random_name() -> String {
    let mut rng = rand::rng();
    let adj = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    format!("{adj}_{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_name_shape() {
        let name = random_name();
        let (adj, noun) = name.split_once('_').unwrap();
        assert!(ADJECTIVES.contains(&adj));
        assert!(NOUNS.contains(&noun));
    }
}
