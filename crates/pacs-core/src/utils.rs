//! 通用工具函数

use chrono::NaiveDate;

/// 按字符数截断字符串，保证不会切断多字节字符
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// 验证DICOM日期格式 (YYYYMMDD)
pub fn is_valid_dicom_date(date: &str) -> bool {
    date.len() == 8
        && date.chars().all(|c| c.is_ascii_digit())
        && NaiveDate::parse_from_str(date, "%Y%m%d").is_ok()
}

/// 清理搜索关键字：去除首尾空白、限制长度
pub fn sanitize_search_term(term: &str, max_chars: usize) -> String {
    truncate_chars(term.trim(), max_chars)
}
