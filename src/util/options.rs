//! Collector tunables.
//!
//! Options are set programmatically (usually through
//! [`PMCSBuilder`](crate::PMCSBuilder)), in bulk from `key=value` strings, or
//! from `PMCS_`-prefixed environment variables (e.g. `PMCS_MAX_PARALLELISM=4`).
//! Each option carries a validator; invalid values are rejected and the
//! previous value is kept.

use std::default::Default;
use std::ops::Deref;

/// A single typed option together with its validity metadata.
#[derive(Debug, Clone)]
pub struct GCOption<T: Clone> {
    value: T,
}

impl<T: Clone> GCOption<T> {
    fn new(value: T) -> Self {
        Self { value }
    }
}

// Dereference an option to get its value.
impl<T: Clone> Deref for GCOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])*$name:ident: $ty:ty [$validator:expr] = $default:expr),* $(,)?) => {
        /// The set of tunables for one collector instance.
        #[derive(Debug, Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: GCOption<$ty>),*
        }

        impl Options {
            /// Set one option from its string representation. Returns `true`
            /// iff the key exists, the value parses and passes validation.
            pub fn set_from_str(&mut self, key: &str, val: &str) -> bool {
                match key {
                    $(stringify!($name) => match val.parse::<$ty>() {
                        Ok(ref parsed) => {
                            let validate = $validator;
                            if validate(parsed) {
                                self.$name.value = parsed.clone();
                                true
                            } else {
                                warn!("unable to set {}={}: value rejected by validator", key, val);
                                false
                            }
                        }
                        Err(_) => {
                            warn!("unable to set {}={}: cannot parse value", key, val);
                            false
                        }
                    },)*
                    _ => panic!("invalid option key: {}", key),
                }
            }

            /// Bulk-set options from whitespace separated `key=value` pairs,
            /// e.g. `"threads=2 mutators_cooperate=true"`. Returns `false` if
            /// any pair is malformed or rejected.
            pub fn set_bulk_from_str(&mut self, options: &str) -> bool {
                for opt in options.split_ascii_whitespace() {
                    let mut kv = opt.splitn(2, '=');
                    let (key, val) = match (kv.next(), kv.next()) {
                        (Some(k), Some(v)) => (k, v),
                        _ => return false,
                    };
                    if !self.set_from_str(key, val) {
                        return false;
                    }
                }
                true
            }

            /// Apply any `PMCS_`-prefixed environment variables that name a
            /// known option.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "PMCS_";
                for (key, val) in std::env::vars() {
                    if let Some(rest) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => {
                                self.set_from_str(lowercase, &val);
                            })*
                            _ => {}
                        }
                    }
                }
            }
        }

        impl Default for Options {
            fn default() -> Self {
                Options {
                    $($name: GCOption::new($default)),*
                }
            }
        }
    };
}

options! {
    /// Number of dedicated auxiliary mark workers, in addition to the main
    /// GC thread. Zero is valid: the main GC thread marks alone (mutators
    /// may still cooperate).
    threads: usize [|v: &usize| !cfg!(feature = "single_threaded_mark") || *v == 0]
        = default_aux_threads(),
    /// Upper bound on threads marking concurrently: main GC thread,
    /// auxiliary workers and cooperating mutators together.
    max_parallelism: usize [|v: &usize| *v > 0] = num_cpus::get(),
    /// Let mutators that reach a safepoint while marking is active scan
    /// their own root set and help with heap traversal.
    mutators_cooperate: bool [always_valid] = false,
}

fn default_aux_threads() -> usize {
    if cfg!(feature = "single_threaded_mark") {
        0
    } else {
        num_cpus::get().saturating_sub(1)
    }
}

impl Options {
    /// Built-in defaults adjusted by `PMCS_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Options::default();
        options.read_env_var_settings();
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn set_valid() {
        let mut options = Options::default();
        assert!(options.set_from_str("threads", "2"));
        assert_eq!(*options.threads, 2);
        assert!(options.set_from_str("mutators_cooperate", "true"));
        assert!(*options.mutators_cooperate);
    }

    #[test]
    fn set_invalid_value_keeps_default() {
        let mut options = Options::default();
        let default_parallelism = *options.max_parallelism;
        assert!(!options.set_from_str("max_parallelism", "0"));
        assert_eq!(*options.max_parallelism, default_parallelism);
        assert!(!options.set_from_str("max_parallelism", "lots"));
        assert_eq!(*options.max_parallelism, default_parallelism);
    }

    #[test]
    #[should_panic]
    fn set_unknown_key_panics() {
        let mut options = Options::default();
        options.set_from_str("no_such_option", "1");
    }

    #[test]
    fn set_bulk() {
        let mut options = Options::default();
        assert!(options.set_bulk_from_str(""));
        assert!(options.set_bulk_from_str("threads=1 max_parallelism=2"));
        assert_eq!(*options.threads, 1);
        assert_eq!(*options.max_parallelism, 2);
        assert!(!options.set_bulk_from_str("threads"));
        assert!(!options.set_bulk_from_str("threads=1 max_parallelism=zero"));
    }

    #[test]
    fn read_env_vars() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("PMCS_MAX_PARALLELISM", "3");
                    let options = Options::from_env();
                    assert_eq!(*options.max_parallelism, 3);
                },
                || {
                    std::env::remove_var("PMCS_MAX_PARALLELISM");
                },
            )
        })
    }
}
