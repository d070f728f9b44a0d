use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// How many issued tokens the selector remembers, across all categories.
const HISTORY_CAP: usize = 50;

const TELUGU: &[&str] = &[
    "Maccha",
    "Bava",
    "Mava",
    "Anna",
    "Akka",
    "Adurs",
    "Keka",
    "Thopu",
    "Kirrak",
    "Katharnak",
    "Bhale Unnavu",
    "Class",
    "Scene",
    "Entira",
    "Avunu",
    "Ledhu",
    "Ra",
    "Le",
    "Lolli",
    "Local",
];

const DESI: &[&str] = &[
    "Arrey",
    "Yaar",
    "Bhai",
    "Sunn",
    "Accha",
    "Jugaad",
    "Pataka",
    "Mast",
    "Jhakaas",
    "Fadu",
    "Funda",
    "Jalwa Dikhana",
    "DM Kar",
];

const GENZ: &[&str] = &[
    "NGL",
    "TBH",
    "RN",
    "FR",
    "IYKYK",
    "FOMO",
    "GOAT",
    "NPC",
    "Rizz",
    "Drip",
    "Bet",
    "Sus",
    "Mid",
    "Cooked",
    "Based",
    "Bussin",
    "Sigma",
    "Touch Grass",
    "Let Him Cook",
    "Locking In",
    "Yap",
    "Delulu",
    "Main Character Energy",
    "It's Giving",
    "Aura",
    "Doomscrolling",
    "Valid",
    "Facts",
    "Fam",
    "Bruh",
    "Slaps",
    "Glow Up",
    "Snatched",
    "Periodt",
];

const DATING: &[&str] = &[
    "Ghosting",
    "Breadcrumbing",
    "Situationship",
    "Love Bombing",
    "Red Flag",
    "Green Flag",
    "The Ick",
    "Soft Launch",
    "Hard Launch",
    "Cuffed",
    "Ship",
    "OTP",
    "Lowkey Crushing",
    "Talking",
    "Thirst Trap",
];

const MEMES: &[&str] = &["Moye Moye", "Just looking like a wow", "Chill Guy"];

/// Static vocabulary pool for a category. Unknown categories are empty.
pub fn category_pool(category: &str) -> &'static [&'static str] {
    match category {
        "telugu" => TELUGU,
        "desi" => DESI,
        "genz" => GENZ,
        "dating" => DATING,
        "memes" => MEMES,
        _ => &[],
    }
}

/// Anti-repetition vocabulary source for the prompt builder.
///
/// Keeps a bounded history of issued tokens so the same handful of favorites
/// does not dominate every prompt. When a category's unused remainder runs
/// low, that category's history is evicted and its tokens become eligible
/// again.
pub struct VocabularySelector {
    history: Vec<String>,
    rng: StdRng,
}

impl VocabularySelector {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            history: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Pick up to `count` tokens from the category, avoiding recently issued
    /// ones. An empty or unknown category yields an empty result.
    pub fn pick(&mut self, category: &str, count: usize) -> Vec<String> {
        let pool = category_pool(category);
        if pool.is_empty() {
            return Vec::new();
        }

        let mut available: Vec<&str> = pool
            .iter()
            .copied()
            .filter(|token| !self.in_history(token))
            .collect();

        // Too little of the pool left unused: let this category start over
        let threshold = (pool.len() as f64 * 0.3).max(3.0);
        if (available.len() as f64) < threshold {
            self.history
                .retain(|seen| !pool.iter().any(|token| token.to_lowercase() == *seen));
            available = pool.to_vec();
        }

        available.shuffle(&mut self.rng);
        available.truncate(count);

        let selected: Vec<String> = available.iter().map(|s| s.to_string()).collect();
        self.history
            .extend(selected.iter().map(|s| s.to_lowercase()));
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_CAP;
            self.history.drain(..excess);
        }

        selected
    }

    fn in_history(&self, token: &str) -> bool {
        let lowered = token.to_lowercase();
        self.history.iter().any(|seen| *seen == lowered)
    }
}

impl Default for VocabularySelector {
    fn default() -> Self {
        Self::new()
    }
}
