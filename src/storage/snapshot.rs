use std::collections::HashSet;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::Xxh3;

use crate::core::{CatalogRecord, LoadError, RawRecord};

/// 快照文件 Header
const MAGIC: u32 = 0xCA7A_0001;
/// schema v1：JSON lines，每行一条 feed 形状的 RawRecord
pub const SCHEMA_JSONL: u32 = 1;
/// schema v2：bincode `Vec<CatalogRecord>`
pub const SCHEMA_BINCODE: u32 = 2;
pub const SCHEMA_CURRENT: u32 = SCHEMA_BINCODE;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
// magic + version + state + record_count + body_len + checksum
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 8;

/// 最多打印多少条被拒记录的明细（其余只计数）
const REJECT_LOG_LIMIT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub schema_version: u32,
    state: u32,
    pub record_count: u32,
    pub body_len: u64,
    pub checksum: u64,
}

impl SnapshotHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut h = [0u8; HEADER_SIZE];
        h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        h[4..8].copy_from_slice(&self.schema_version.to_le_bytes());
        h[8..12].copy_from_slice(&self.state.to_le_bytes());
        h[12..16].copy_from_slice(&self.record_count.to_le_bytes());
        h[16..24].copy_from_slice(&self.body_len.to_le_bytes());
        h[24..32].copy_from_slice(&self.checksum.to_le_bytes());
        h
    }

    /// 解析并校验 magic/state/version。长度与 checksum 由调用方对照 body 校验。
    pub fn decode(data: &[u8]) -> Result<Self, LoadError> {
        if data.len() < HEADER_SIZE {
            return Err(LoadError::Corrupt(format!(
                "file too small for header ({} bytes)",
                data.len()
            )));
        }
        let u32_at = |off: usize| u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[off..off + 8]);
            u64::from_le_bytes(b)
        };

        let magic = u32_at(0);
        if magic != MAGIC {
            return Err(LoadError::Corrupt(format!(
                "magic mismatch: {:#x} != {:#x}",
                magic, MAGIC
            )));
        }
        let header = Self {
            schema_version: u32_at(4),
            state: u32_at(8),
            record_count: u32_at(12),
            body_len: u64_at(16),
            checksum: u64_at(24),
        };
        if header.state != STATE_COMMITTED {
            return Err(LoadError::Corrupt("snapshot state INCOMPLETE".into()));
        }
        if header.schema_version != SCHEMA_JSONL && header.schema_version != SCHEMA_BINCODE {
            return Err(LoadError::SchemaMismatch {
                found: header.schema_version,
            });
        }
        Ok(header)
    }
}

/// 解码结果：已校验、已去重的记录
#[derive(Debug)]
pub struct DecodedSnapshot {
    pub schema_version: u32,
    pub records: Vec<CatalogRecord>,
    /// 被拒（畸形 / 缺字段 / 重复 id）的记录数
    pub rejected: usize,
}

/// 只读 header（下载完成后用于与源端声明的 schema 交叉校验）
pub fn read_header(path: &Path) -> Result<SnapshotHeader, LoadError> {
    let mut f = std::fs::File::open(path)?;
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    SnapshotHeader::decode(&buf[..filled])
}

/// 读取并完整校验快照文件
pub fn decode_file(path: &Path) -> Result<DecodedSnapshot, LoadError> {
    let data = std::fs::read(path)?;
    decode_bytes(&data)
}

pub fn decode_bytes(data: &[u8]) -> Result<DecodedSnapshot, LoadError> {
    let header = SnapshotHeader::decode(data)?;

    let body = &data[HEADER_SIZE..];
    if body.len() as u64 != header.body_len {
        return Err(LoadError::Corrupt(format!(
            "body length mismatch: {} != {}",
            body.len(),
            header.body_len
        )));
    }
    let computed = xxhash_rust::xxh3::xxh3_64(body);
    if computed != header.checksum {
        return Err(LoadError::Corrupt(format!(
            "body checksum mismatch: {:#x} != {:#x}",
            computed, header.checksum
        )));
    }

    let (records, rejected) = match header.schema_version {
        SCHEMA_JSONL => decode_feed(body),
        SCHEMA_BINCODE => {
            let records: Vec<CatalogRecord> = bincode::deserialize(body)
                .map_err(|e| LoadError::Corrupt(format!("bincode decode failed: {}", e)))?;
            let (valid, invalid) = validate_records(records);
            let (kept, dupes) = dedup_by_id(valid);
            (kept, invalid + dupes)
        }
        other => return Err(LoadError::SchemaMismatch { found: other }),
    };

    if records.len() + rejected != header.record_count as usize {
        return Err(LoadError::Corrupt(format!(
            "record count mismatch: header says {}, body has {}",
            header.record_count,
            records.len() + rejected
        )));
    }

    Ok(DecodedSnapshot {
        schema_version: header.schema_version,
        records,
        rejected,
    })
}

/// 解析 JSON-lines feed：畸形行、缺字段、重复 id 计入 rejected，不致命
pub fn decode_feed(body: &[u8]) -> (Vec<CatalogRecord>, usize) {
    let mut records = Vec::new();
    let mut rejected = 0usize;
    let mut seen: HashSet<u64> = HashSet::new();

    for (lineno, line) in body.split(|&b| b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let verdict = serde_json::from_slice::<RawRecord>(line)
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.validate().map_err(|r| r.to_string()));
        match verdict {
            Ok(rec) if seen.insert(rec.asset_id) => records.push(rec),
            Ok(rec) => {
                rejected += 1;
                if rejected <= REJECT_LOG_LIMIT {
                    tracing::warn!("line {}: duplicate assetId {}, keeping first", lineno + 1, rec.asset_id);
                }
            }
            Err(reason) => {
                rejected += 1;
                if rejected <= REJECT_LOG_LIMIT {
                    tracing::warn!("line {}: record rejected: {}", lineno + 1, reason);
                }
            }
        }
    }
    if rejected > REJECT_LOG_LIMIT {
        tracing::warn!("{} records rejected in total", rejected);
    }
    (records, rejected)
}

/// v2 记录与 feed 行走同一套规范化与必填检查
fn validate_records(records: Vec<CatalogRecord>) -> (Vec<CatalogRecord>, usize) {
    let mut kept = Vec::with_capacity(records.len());
    let mut rejected = 0usize;
    for rec in records {
        let asset_id = rec.asset_id;
        match rec.validated() {
            Ok(rec) => kept.push(rec),
            Err(reason) => {
                rejected += 1;
                if rejected <= REJECT_LOG_LIMIT {
                    tracing::warn!("assetId {}: record rejected: {}", asset_id, reason);
                }
            }
        }
    }
    if rejected > REJECT_LOG_LIMIT {
        tracing::warn!("{} records rejected in total", rejected);
    }
    (kept, rejected)
}

fn dedup_by_id(records: Vec<CatalogRecord>) -> (Vec<CatalogRecord>, usize) {
    let mut seen: HashSet<u64> = HashSet::with_capacity(records.len());
    let total = records.len();
    let kept: Vec<CatalogRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.asset_id))
        .collect();
    let dupes = total - kept.len();
    if dupes > 0 {
        tracing::warn!("{} duplicate assetIds dropped", dupes);
    }
    (kept, dupes)
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// 快照文件写端（发布侧 / 测试用）
///
/// 落盘流程：
/// 1) 写 `.<name>.write.tmp` 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) 流式写 body，边写边算 xxh3 / 长度
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)：原子替换
/// 6) fsync(dir)
///
/// 任一步失败 target 都保持旧内容；加载端对 magic/state/len/checksum 全部校验。
pub struct SnapshotWriter {
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 返回写入的总字节数（含 header）
    pub fn write_atomic(
        &self,
        records: &[CatalogRecord],
        schema_version: u32,
    ) -> std::io::Result<u64> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path_for(&self.path);
        let result = self.write_tmp(&tmp_path, records, schema_version);
        let total = match result {
            Ok(total) => total,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        std::fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::info!(
            "Snapshot written: {} records, {} bytes, schema v{}",
            records.len(),
            total,
            schema_version
        );
        Ok(total)
    }

    fn write_tmp(
        &self,
        tmp_path: &Path,
        records: &[CatalogRecord],
        schema_version: u32,
    ) -> std::io::Result<u64> {
        let mut file = std::fs::File::create(tmp_path)?;
        let total = encode_into(&mut file, records, schema_version)?;
        file.sync_all()?;
        Ok(total)
    }
}

/// 内存编码（发布前计算 sha256、测试构造远端 blob）
pub fn encode(records: &[CatalogRecord], schema_version: u32) -> std::io::Result<Vec<u8>> {
    let mut cur = std::io::Cursor::new(Vec::new());
    encode_into(&mut cur, records, schema_version)?;
    Ok(cur.into_inner())
}

/// 先写 INCOMPLETE header，流式写 body，再 seek 回开头覆盖 COMMITTED header。
/// 返回总字节数（含 header）。
///
/// 记录先经 [`CatalogRecord::normalized`] 再落盘，因此重新加载的结果与
/// 规范化后的输入逐字段相同（两种 schema 一致）。空 name 照写，由加载端拒绝。
pub fn encode_into<W: Write + Seek>(
    out: &mut W,
    records: &[CatalogRecord],
    schema_version: u32,
) -> std::io::Result<u64> {
    if schema_version != SCHEMA_JSONL && schema_version != SCHEMA_BINCODE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot write schema version {}", schema_version),
        ));
    }
    let record_count: u32 = records.len().try_into().map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "too many records")
    })?;

    let mut header = SnapshotHeader {
        schema_version,
        state: STATE_INCOMPLETE,
        record_count,
        body_len: 0,
        checksum: 0,
    };
    out.write_all(&header.encode())?;

    let (body_len, checksum) = {
        let mut buf = BufWriter::new(&mut *out);
        let mut cw = ChecksumWriter::new(&mut buf);
        match schema_version {
            SCHEMA_JSONL => {
                for r in records {
                    let r = r.clone().normalized();
                    serde_json::to_writer(&mut cw, &RawRecord::from(&r))?;
                    cw.write_all(b"\n")?;
                }
            }
            _ => {
                let normalized: Vec<CatalogRecord> =
                    records.iter().cloned().map(CatalogRecord::normalized).collect();
                bincode::serialize_into(&mut cw, &normalized).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                })?;
            }
        }
        let sums = cw.finish();
        buf.flush()?;
        sums
    };

    out.seek(SeekFrom::Start(0))?;
    header.state = STATE_COMMITTED;
    header.body_len = body_len;
    header.checksum = checksum;
    out.write_all(&header.encode())?;
    out.flush()?;

    Ok(HEADER_SIZE as u64 + body_len)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    path.with_file_name(format!(".{}.write.tmp", name))
}
