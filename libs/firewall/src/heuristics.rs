//! Lightweight domain heuristics: DGA detection via a
//! likelihood-of-meaningful-substring (LMS) score and the relatedness check
//! behind auto-permit.

/// Bigrams that are common in natural-language (and brand-name) labels.
///
/// The LMS score is the fraction of a label's bigrams found in this table,
/// scaled to 0..=10. Randomly generated labels share almost no bigrams with
/// it.
const COMMON_BIGRAMS: &[&str] = &[
    "ab", "ac", "ad", "ag", "ai", "ak", "al", "am", "an", "ap", "ar", "as", "at", "au", "av",
    "ay", "ba", "be", "bi", "bl", "bo", "br", "bu", "ca", "ce", "ch", "ci", "ck", "cl", "co",
    "ct", "cu", "da", "de", "di", "do", "dr", "du", "ea", "ec", "ed", "ee", "eg", "el", "em",
    "en", "ep", "er", "es", "et", "ev", "ex", "ey", "fa", "fe", "fi", "fl", "fo", "fr", "fu",
    "ga", "ge", "gi", "gl", "go", "gr", "gu", "ha", "he", "hi", "ho", "hu", "ia", "ib", "ic",
    "id", "ie", "if", "ig", "il", "im", "in", "io", "ip", "ir", "is", "it", "iv", "ke", "ki",
    "la", "le", "li", "ll", "lo", "lu", "ly", "ma", "me", "mi", "mo", "mp", "mu", "na", "nc",
    "nd", "ne", "ng", "ni", "no", "ns", "nt", "nu", "ob", "oc", "od", "of", "og", "ol", "om",
    "on", "oo", "op", "or", "os", "ot", "ou", "ov", "ow", "pa", "pe", "ph", "pi", "pl", "po",
    "pr", "pu", "qu", "ra", "re", "ri", "ro", "ru", "sa", "sc", "se", "sh", "si", "so", "sp",
    "ss", "st", "su", "ta", "te", "th", "ti", "to", "tr", "tt", "tu", "ty", "ub", "uc", "ud",
    "ue", "ug", "ul", "um", "un", "up", "ur", "us", "ut", "va", "ve", "vi", "vo", "wa", "we",
    "wh", "wi", "wo", "ye", "yo",
];

/// Scores how much a string looks like meaningful language, 0..=100.
///
/// The squared bigram hit rate separates language (which chains common
/// bigrams) sharply from generated noise. Digits and separators are
/// ignored; a string without at least two letters scores 0.
pub fn lms_score(s: &str) -> f64 {
    let letters: Vec<char> = s
        .chars()
        .flat_map(|c| c.to_lowercase())
        .filter(|c| c.is_ascii_alphabetic())
        .collect();

    if letters.len() < 2 {
        return 0.0;
    }

    let mut hits = 0usize;
    let mut total = 0usize;

    for pair in letters.windows(2) {
        let bigram: String = pair.iter().collect();
        total += 1;
        if COMMON_BIGRAMS.contains(&bigram.as_str()) {
            hits += 1;
        }
    }

    let rate = hits as f64 / total as f64;

    100.0 * rate * rate
}

/// Second-level suffixes under which the registrable domain sits one label
/// deeper, e.g. `example.co.uk`.
const SECOND_LEVEL_SUFFIXES: &[&str] = &[
    "ac.uk", "co.at", "co.jp", "co.in", "co.kr", "co.nz", "co.uk", "co.za", "com.ar", "com.au",
    "com.br", "com.cn", "com.mx", "com.tr", "com.tw", "gov.uk", "ne.jp", "net.au", "or.jp",
    "org.au", "org.uk",
];

/// The effective TLD plus one label, e.g. `example.com` for
/// `cdn.a.example.com`.
pub fn etld_plus_one(domain: &str) -> &str {
    fn tail<'a>(domain: &'a str, labels: &[&str], keep: usize) -> &'a str {
        let len: usize = labels[labels.len() - keep..]
            .iter()
            .map(|l| l.len() + 1)
            .sum::<usize>()
            - 1;

        &domain[domain.len() - len..]
    }

    let domain = domain.trim_end_matches('.');
    let labels: Vec<&str> = domain.split('.').collect();

    if labels.len() <= 2 {
        return domain;
    }

    let keep = if SECOND_LEVEL_SUFFIXES.contains(&tail(domain, &labels, 2)) { 3 } else { 2 };

    tail(domain, &labels, keep)
}

/// Severity thresholds of the DGA heuristic.
pub const DGA_THRESHOLD: f64 = 5.0;
pub const TUNNEL_THRESHOLD: f64 = 10.0;
/// Subdomain overhead (beyond the registrable domain) at which the whole
/// name is scored for DNS tunneling.
pub const TUNNEL_MIN_OVERHEAD: usize = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum DomainAnomaly {
    /// The registrable label looks machine-generated.
    SuspectedDga,
    /// An excessively long subdomain chain that does not look like language.
    SuspectedTunnel,
}

/// Applies the DGA/tunnel heuristics to a full domain name.
pub fn check_domain(domain: &str) -> Option<DomainAnomaly> {
    let domain = domain.trim_end_matches('.');
    let registrable = etld_plus_one(domain);

    // Score only the registrable label, the suffix is always meaningful.
    let label = registrable.split('.').next().unwrap_or(registrable);
    if lms_score(label) < DGA_THRESHOLD {
        return Some(DomainAnomaly::SuspectedDga);
    }

    let overhead = domain.len().saturating_sub(registrable.len());
    if overhead >= TUNNEL_MIN_OVERHEAD && lms_score(domain) < TUNNEL_THRESHOLD {
        return Some(DomainAnomaly::SuspectedTunnel);
    }

    None
}

/// Levenshtein distance, used for the relatedness check.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.iter().enumerate() {
        let mut previous_diagonal = row[0];
        row[0] = i + 1;

        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            let value = (previous_diagonal + cost).min(row[j] + 1).min(row[j + 1] + 1);
            previous_diagonal = row[j + 1];
            row[j + 1] = value;
        }
    }

    row[b.len()]
}

/// Similarity in 0..=1; 1 means equal.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }

    1.0 - levenshtein(&a.to_ascii_lowercase(), &b.to_ascii_lowercase()) as f64 / longest as f64
}

/// Auto-permit threshold.
pub const RELATED_THRESHOLD: f64 = 0.5;

/// Finds a domain label related to one of the process references.
///
/// Returns `(label, reference)` of the first pair whose similarity exceeds
/// the threshold.
pub fn find_related<'a>(
    domain: &'a str,
    references: &[&'a str],
) -> Option<(&'a str, &'a str)> {
    for label in domain.trim_end_matches('.').split('.') {
        if label.len() < 3 {
            continue;
        }

        for reference in references {
            if similarity(label, reference) > RELATED_THRESHOLD {
                return Some((label, reference));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("google"; "google")]
    #[test_case("example"; "example")]
    #[test_case("curl"; "curl")]
    #[test_case("wikipedia"; "wikipedia")]
    fn real_labels_score_meaningful(label: &str) {
        assert!(lms_score(label) >= DGA_THRESHOLD, "{label}: {}", lms_score(label));
    }

    #[test_case("xzqwvbntrlkmfj"; "consonant mash")]
    #[test_case("qxkzvw"; "short mash")]
    #[test_case("x2q9wv7b"; "digit mix")]
    fn generated_labels_score_low(label: &str) {
        assert!(lms_score(label) < DGA_THRESHOLD, "{label}: {}", lms_score(label));
    }

    #[test_case("cdn.a.example.com", "example.com"; "subdomain")]
    #[test_case("example.com", "example.com"; "bare domain")]
    #[test_case("example.com.", "example.com"; "trailing dot")]
    #[test_case("www.example.co.uk", "example.co.uk"; "multi label tld")]
    #[test_case("localhost", "localhost"; "localhost")]
    fn registrable_domain(domain: &str, expected: &str) {
        assert_eq!(etld_plus_one(domain), expected);
    }

    #[test]
    fn dga_domain_is_flagged() {
        assert_eq!(
            check_domain("xzqwvbntrlkmfj.example."),
            Some(DomainAnomaly::SuspectedDga)
        );
        assert_eq!(check_domain("curl.example.com"), None);
    }

    #[test]
    fn tunnel_domains_are_flagged_by_length_and_score() {
        let chunk = "xq9z7kv2".repeat(14); // 112 chars of noise
        let domain = format!("{chunk}.example.com");

        assert_eq!(check_domain(&domain), Some(DomainAnomaly::SuspectedTunnel));

        // A long but readable subdomain chain passes.
        let readable = "the.quick.brown.fox.jumps.over.the.lazy.dog.and.then.some.more.words.to.get.past.one.hundred.characters.total";
        let domain = format!("{readable}.example.com");
        assert_eq!(check_domain(&domain), None);
    }

    #[test_case("curl", "curl", 1.0)]
    #[test_case("curl", "curly", 0.8)]
    #[test_case("abcd", "wxyz", 0.0)]
    fn similarity_values(a: &str, b: &str, expected: f64) {
        assert!((similarity(a, b) - expected).abs() < 1e-9);
    }

    #[test]
    fn related_labels_are_found() {
        let found = find_related("curl.example.com", &["bin", "curl", "curl"]);

        assert_eq!(found, Some(("curl", "curl")));
    }

    #[test]
    fn unrelated_domains_are_not() {
        assert!(find_related("tracker.example.com", &["bin", "curl"]).is_none());
    }
}
