use unicode_normalization::UnicodeNormalization;

/// case fold：NFC 后逐字符 lowercase（"É" 与 "e\u{301}" 折叠到同一形式）
pub fn fold(s: &str) -> String {
    s.nfc().flat_map(char::to_lowercase).collect()
}

/// 按非字母数字切词（输入应已 fold）
pub fn tokens(folded: &str) -> impl Iterator<Item = &str> {
    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
}

/// char 级 trigram，打包成 u64（每个 char 21 bit）
pub fn trigrams(folded: &str) -> Vec<u64> {
    let chars: Vec<char> = folded.chars().collect();
    if chars.len() < 3 {
        return Vec::new();
    }
    let mut out: Vec<u64> = chars
        .windows(3)
        .map(|w| pack(w[0], w[1], w[2]))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn pack(a: char, b: char, c: char) -> u64 {
    ((a as u64) << 42) | ((b as u64) << 21) | (c as u64)
}

/// `needle` 是否在某个词的起点出现（位置 0 或前一个字符非字母数字）
pub fn occurs_at_word_start(hay: &str, needle: &str) -> bool {
    hay.match_indices(needle).any(|(i, _)| {
        hay[..i]
            .chars()
            .next_back()
            .map_or(true, |prev| !prev.is_alphanumeric())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_case_and_normalization_insensitive() {
        assert_eq!(fold("Red HAT"), "red hat");
        assert_eq!(fold("Caf\u{e9}"), fold("CAFE\u{301}"));
    }

    #[test]
    fn tokens_split_on_punctuation() {
        let f = fold("Super-Cool  Hat (2019)");
        let t: Vec<&str> = tokens(&f).collect();
        assert_eq!(t, vec!["super", "cool", "hat", "2019"]);
    }

    #[test]
    fn trigrams_are_deduped_and_short_strings_have_none() {
        assert!(trigrams("ab").is_empty());
        assert_eq!(trigrams("aaaa").len(), 1);
        assert_eq!(trigrams("abcd").len(), 2);
    }

    #[test]
    fn word_start_detection() {
        assert!(occurs_at_word_start("red hat", "hat"));
        assert!(occurs_at_word_start("red-hat", "hat"));
        assert!(!occurs_at_word_start("chat room", "hat"));
        assert!(occurs_at_word_start("chat hat", "hat"));
        assert!(occurs_at_word_start("hat", "hat"));
    }
}
