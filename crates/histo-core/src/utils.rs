//! 通用工具函数

/// 登记编号的存储长度上限 (数据库列 `accession_id VARCHAR(32)`)
pub const MAX_ACCESSION_ID_LEN: usize = 32;

/// 前缀长度上限：为年份和最长的十位序号预留位置
pub const MAX_ACCESSION_PREFIX_LEN: usize = MAX_ACCESSION_ID_LEN - "-YYYY-".len() - 10;

/// 生成登记编号: PREFIX-YYYY-NNNN
pub fn format_accession_id(prefix: &str, year: i32, sequence: u32) -> String {
    format!("{}-{:04}-{:04}", prefix, year, sequence)
}

/// 解析登记编号，返回 (前缀, 年份, 序号)
pub fn parse_accession_id(accession_id: &str) -> Option<(&str, i32, u32)> {
    let mut parts = accession_id.rsplitn(3, '-');
    let sequence = parts.next()?;
    let year = parts.next()?;
    let prefix = parts.next()?;

    if prefix.is_empty() || year.len() != 4 || sequence.len() < 4 {
        return None;
    }
    if !year.chars().all(|c| c.is_ascii_digit()) || !sequence.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let sequence: u32 = sequence.parse().ok()?;
    if sequence == 0 {
        return None;
    }
    Some((prefix, year.parse().ok()?, sequence))
}

/// 空字符串或仅含空白
pub fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}
