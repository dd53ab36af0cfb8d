use crate::index::text;

/// 命中等级：越小越靠前
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    /// 查询出现在某个词的起点（单词查询即“词前缀”）
    WordPrefix,
    /// 仅作为子串出现
    Substring,
}

/// 关键字匹配器：查询与名字都先 fold，再判定命中等级。
///
/// 命中条件：fold 后的查询是 fold 后名字的子串（词前缀是其特例）。
pub struct KeywordMatcher {
    folded: String,
    single_token: bool,
    char_len: usize,
}

impl KeywordMatcher {
    /// 空白查询返回 None
    pub fn new(query: &str) -> Option<Self> {
        let folded = text::fold(query.trim());
        if folded.is_empty() {
            return None;
        }
        let single_token = folded.chars().all(char::is_alphanumeric);
        let char_len = folded.chars().count();
        Some(Self {
            folded,
            single_token,
            char_len,
        })
    }

    pub fn folded(&self) -> &str {
        &self.folded
    }

    pub fn char_len(&self) -> usize {
        self.char_len
    }

    /// 可用于词表前缀过滤的固定前缀：只有单词查询才有。
    /// 此时“在词起点出现”与“是某个词的前缀”等价。
    pub fn token_prefix(&self) -> Option<&str> {
        self.single_token.then_some(self.folded.as_str())
    }

    pub fn classify(&self, folded_name: &str) -> Option<MatchTier> {
        if !folded_name.contains(&self.folded) {
            return None;
        }
        if text::occurs_at_word_start(folded_name, &self.folded) {
            Some(MatchTier::WordPrefix)
        } else {
            Some(MatchTier::Substring)
        }
    }
}
