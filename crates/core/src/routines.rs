use crate::error::RoutineError;
use crate::models::RawSpan;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// A named extraction routine: full text in, matched spans out. Routines
/// must not have side effects; a failure is isolated to the entity type
/// that referenced the routine.
pub type ExtractionRoutine = Box<dyn Fn(&str) -> Result<Vec<RawSpan>, RoutineError> + Send + Sync>;

const IPV4_PATTERN: &str = r"\b(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b";

const URL_PATTERN: &str = r"\b(?:https?|ftp)://\S+";

/// Startup-time registry mapping routine names to extraction functions.
/// Catalog rules reference routines symbolically; an unresolved name
/// degrades to zero matches instead of failing the run.
pub struct RoutineRegistry {
    routines: HashMap<String, ExtractionRoutine>,
}

impl Default for RoutineRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl RoutineRegistry {
    pub fn empty() -> Self {
        Self {
            routines: HashMap::new(),
        }
    }

    /// Registry preloaded with the stock routines: `ipv4`, `ipv4-private`,
    /// `ipv4-public`, and `url`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();

        let ipv4 = Regex::new(IPV4_PATTERN).expect("fixed ipv4 pattern compiles");
        let url = Regex::new(URL_PATTERN).expect("fixed url pattern compiles");

        let any = ipv4.clone();
        registry.register("ipv4", move |text| Ok(scan_ipv4(&any, text, |_| true)));

        let private = ipv4.clone();
        registry.register("ipv4-private", move |text| {
            Ok(scan_ipv4(&private, text, is_private_address))
        });

        let public = ipv4;
        registry.register("ipv4-public", move |text| {
            Ok(scan_ipv4(&public, text, is_public_address))
        });

        registry.register("url", move |text| {
            let spans = url
                .find_iter(text)
                .filter(|candidate| has_registrable_host(candidate.as_str()))
                .map(|candidate| RawSpan {
                    text: candidate.as_str().to_string(),
                    start: candidate.start(),
                    end: candidate.end(),
                })
                .collect();
            Ok(spans)
        });

        registry
    }

    pub fn register<F>(&mut self, name: &str, routine: F)
    where
        F: Fn(&str) -> Result<Vec<RawSpan>, RoutineError> + Send + Sync + 'static,
    {
        self.routines.insert(name.to_string(), Box::new(routine));
    }

    /// Registers a case-insensitive whole-word scan over `words`.
    pub fn register_wordlist(&mut self, name: &str, words: Vec<String>) {
        let words: Vec<String> = words
            .into_iter()
            .map(|word| word.trim().to_string())
            .filter(|word| !word.is_empty())
            .collect();

        if words.is_empty() {
            self.register(name, |_| Ok(Vec::new()));
            return;
        }

        let alternation = words
            .iter()
            .map(|word| regex::escape(word))
            .collect::<Vec<_>>()
            .join("|");

        let routine_name = name.to_string();
        let pattern = RegexBuilder::new(&format!(r"\b(?:{alternation})\b"))
            .case_insensitive(true)
            .build();

        match pattern {
            Ok(pattern) => self.register(name, move |text| {
                let spans = pattern
                    .find_iter(text)
                    .map(|hit| RawSpan {
                        text: hit.as_str().to_string(),
                        start: hit.start(),
                        end: hit.end(),
                    })
                    .collect();
                Ok(spans)
            }),
            Err(error) => {
                let message = error.to_string();
                self.register(name, move |_| {
                    Err(RoutineError::Failed {
                        name: routine_name.clone(),
                        message: message.clone(),
                    })
                });
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }

    pub fn invoke(&self, name: &str, content: &str) -> Result<Vec<RawSpan>, RoutineError> {
        let routine = self
            .routines
            .get(name)
            .ok_or_else(|| RoutineError::Missing(name.to_string()))?;
        routine(content)
    }
}

fn scan_ipv4<F>(pattern: &Regex, text: &str, keep: F) -> Vec<RawSpan>
where
    F: Fn(Ipv4Addr) -> bool,
{
    pattern
        .find_iter(text)
        .filter_map(|candidate| {
            let address: Ipv4Addr = candidate.as_str().parse().ok()?;
            if keep(address) {
                Some(RawSpan {
                    text: candidate.as_str().to_string(),
                    start: candidate.start(),
                    end: candidate.end(),
                })
            } else {
                None
            }
        })
        .collect()
}

fn is_private_address(address: Ipv4Addr) -> bool {
    address.is_private() || address.is_loopback() || address.is_link_local()
}

fn is_public_address(address: Ipv4Addr) -> bool {
    !is_private_address(address)
        && !address.is_broadcast()
        && !address.is_multicast()
        && !address.is_unspecified()
}

/// Structural host check standing in for a public-suffix lookup: the host
/// must carry at least two labels and an alphabetic top-level label.
fn has_registrable_host(url: &str) -> bool {
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => return false,
    };

    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host = authority
        .rsplit('@')
        .next()
        .unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();

    let mut labels = host.rsplit('.');
    let tld = labels.next().unwrap_or_default();
    let domain = labels.next().unwrap_or_default();

    !domain.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}
