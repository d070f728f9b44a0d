use rand::seq::SliceRandom;
use rand::Rng;

/// Language register a greeting is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingRegister {
    Telugu,
    Hindi,
    English,
    Mixed,
}

impl GreetingRegister {
    /// Parse a config value; anything unrecognized means "no preference".
    pub fn from_config(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "telugu" => Some(GreetingRegister::Telugu),
            "hindi" => Some(GreetingRegister::Hindi),
            "english" => Some(GreetingRegister::English),
            "mixed" => Some(GreetingRegister::Mixed),
            _ => None,
        }
    }
}

struct Greeting {
    text: &'static str,
    register: GreetingRegister,
}

/// Canned check-in lines, sent verbatim after a long absence. Short, teasing,
/// one-and-a-half lines at most. No generator call is made for these.
const GREETING_POOL: &[Greeting] = &[
    Greeting {
        text: "Ekkada sachav ra? Inni rojulu ghost aipoyav?",
        register: GreetingRegister::Telugu,
    },
    Greeting {
        text: "Alive ah ra? Nenu inka nuvvu sanyasam tiskunnav anukunna!",
        register: GreetingRegister::Telugu,
    },
    Greeting {
        text: "Vachadra babu! Finally! Ekkada undevu inni rojulu?",
        register: GreetingRegister::Telugu,
    },
    Greeting {
        text: "Silent aipoyav ra? Emaindi? Ghost aipoyava?",
        register: GreetingRegister::Telugu,
    },
    Greeting {
        text: "Kahan tha re tu? Underground don ban gaya kya?",
        register: GreetingRegister::Hindi,
    },
    Greeting {
        text: "Zinda hai ya sirf Instagram stories pe active hai?",
        register: GreetingRegister::Hindi,
    },
    Greeting {
        text: "Kahan the bhai? Ghost kar diya na mujhe?",
        register: GreetingRegister::Hindi,
    },
    Greeting {
        text: "Arre, finally aaya! Celebrity entry hai kya?",
        register: GreetingRegister::Hindi,
    },
    Greeting {
        text: "Ayo, long time no see! What's the scene?",
        register: GreetingRegister::English,
    },
    Greeting {
        text: "Yo, you good? Or did you touch grass for too long?",
        register: GreetingRegister::English,
    },
    Greeting {
        text: "Wassup? Missed the gossip session. Fill me in, ASAP.",
        register: GreetingRegister::English,
    },
    Greeting {
        text: "Fr? Thought you died or something. No cap.",
        register: GreetingRegister::English,
    },
    Greeting {
        text: "Ekkada sachav inni rojulu, fam? Ghost aipoyava?",
        register: GreetingRegister::Mixed,
    },
    Greeting {
        text: "Kahan the bhai? Nenu inka nuvvu delete aipoyav anukunna!",
        register: GreetingRegister::Mixed,
    },
    Greeting {
        text: "reyyyy my wait time for your reply was longer than a Hyderabad traffic jam, fr!",
        register: GreetingRegister::Mixed,
    },
    Greeting {
        text: "Alive ah bro? Thought you got ghosted by the internet!",
        register: GreetingRegister::Mixed,
    },
];

/// The line a brand-new, empty room opens with.
pub const OPENING_LINE: &str = "heyyyy how you doingg";

/// Pick one check-in line, preferring the requested register and falling back
/// to the whole pool when that register has no entries.
pub fn pick_greeting<R: Rng>(register: Option<GreetingRegister>, rng: &mut R) -> &'static str {
    let candidates: Vec<&Greeting> = match register {
        Some(register) => GREETING_POOL
            .iter()
            .filter(|g| g.register == register)
            .collect(),
        None => GREETING_POOL.iter().collect(),
    };

    let candidates = if candidates.is_empty() {
        GREETING_POOL.iter().collect()
    } else {
        candidates
    };

    candidates
        .choose(rng)
        .map(|g| g.text)
        .unwrap_or(OPENING_LINE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn register_filter_only_yields_that_register() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..20 {
            let line = pick_greeting(Some(GreetingRegister::Hindi), &mut rng);
            assert!(GREETING_POOL
                .iter()
                .any(|g| g.text == line && g.register == GreetingRegister::Hindi));
        }
    }

    #[test]
    fn no_preference_draws_from_whole_pool() {
        let mut rng = StdRng::seed_from_u64(5);
        let line = pick_greeting(None, &mut rng);
        assert!(GREETING_POOL.iter().any(|g| g.text == line));
    }

    #[test]
    fn config_parse_accepts_known_registers_only() {
        assert_eq!(
            GreetingRegister::from_config("telugu"),
            Some(GreetingRegister::Telugu)
        );
        assert_eq!(
            GreetingRegister::from_config("Mixed"),
            Some(GreetingRegister::Mixed)
        );
        assert_eq!(GreetingRegister::from_config("french"), None);
    }
}
