use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 目录中的一条商品记录（快照内不可变）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    /// 唯一主键
    pub asset_id: u64,
    pub product_id: Option<u64>,
    pub name: String,
    pub description: Option<String>,
    pub asset_type_id: Option<u32>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub price_in_robux: Option<u64>,
    pub is_for_sale: bool,
    pub is_limited: bool,
    pub is_limited_unique: bool,
    /// 快照生成时的历史销量（overlay 缺席时的回退值）
    pub sales_snapshot: u64,
    /// 不透明字段：原样保存，不解析
    pub collectibles_detail: Option<String>,
}

/// 外部 feed 的原始记录形状：所有字段都可能缺失。
///
/// 只有经过 [`RawRecord::validate`] 的记录才能进入快照。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub asset_id: Option<u64>,
    #[serde(default)]
    pub product_id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub asset_type_id: Option<u32>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub price_in_robux: Option<u64>,
    #[serde(default)]
    pub is_for_sale: Option<bool>,
    #[serde(default)]
    pub is_limited: Option<bool>,
    #[serde(default)]
    pub is_limited_unique: Option<bool>,
    #[serde(default, alias = "sales")]
    pub sales_snapshot: Option<u64>,
    /// feed 里可能是字符串也可能是对象；统一落成字符串
    #[serde(default)]
    pub collectibles_detail: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    MissingAssetId,
    BlankName,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingAssetId => f.write_str("missing assetId"),
            RejectReason::BlankName => f.write_str("blank name"),
        }
    }
}

impl CatalogRecord {
    /// 去掉 name/description 首尾空白，空描述视为缺失。幂等。
    pub fn normalized(mut self) -> Self {
        let trimmed = self.name.trim();
        if trimmed.len() != self.name.len() {
            self.name = trimmed.to_string();
        }
        self.description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self
    }

    /// 规范化后检查必填字段（name 非空）。两种 schema 加载时都走这里。
    pub fn validated(self) -> Result<Self, RejectReason> {
        let rec = self.normalized();
        if rec.name.is_empty() {
            return Err(RejectReason::BlankName);
        }
        Ok(rec)
    }
}

impl RawRecord {
    /// 校验并规范化：assetId 与 name 必填；字符串去首尾空白，空描述视为缺失。
    pub fn validate(self) -> Result<CatalogRecord, RejectReason> {
        let asset_id = self.asset_id.ok_or(RejectReason::MissingAssetId)?;

        let collectibles_detail = match self.collectibles_detail {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };

        CatalogRecord {
            asset_id,
            product_id: self.product_id,
            name: self.name.unwrap_or_default(),
            description: self.description,
            asset_type_id: self.asset_type_id,
            created: self.created,
            updated: self.updated,
            price_in_robux: self.price_in_robux,
            is_for_sale: self.is_for_sale.unwrap_or(false),
            is_limited: self.is_limited.unwrap_or(false),
            is_limited_unique: self.is_limited_unique.unwrap_or(false),
            sales_snapshot: self.sales_snapshot.unwrap_or(0),
            collectibles_detail,
        }
        .validated()
    }
}

impl From<&CatalogRecord> for RawRecord {
    fn from(r: &CatalogRecord) -> Self {
        Self {
            asset_id: Some(r.asset_id),
            product_id: r.product_id,
            name: Some(r.name.clone()),
            description: r.description.clone(),
            asset_type_id: r.asset_type_id,
            created: r.created,
            updated: r.updated,
            price_in_robux: r.price_in_robux,
            is_for_sale: Some(r.is_for_sale),
            is_limited: Some(r.is_limited),
            is_limited_unique: Some(r.is_limited_unique),
            sales_snapshot: Some(r.sales_snapshot),
            collectibles_detail: r
                .collectibles_detail
                .clone()
                .map(serde_json::Value::String),
        }
    }
}
