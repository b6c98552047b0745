//! task id 推导。id 是 url（剔除 filter 指定的 query 参数后）加元信息的
//! sha256 摘要，注册与事件分片都用它做 key，必须保持逐位稳定。

use diaodu_util::hash::sha256_hex;

use crate::protocol::UrlMeta;

/// 参与二次散列的尾部长度
const TAIL_LEN: usize = 10;

/// 生成 task id
///
/// 拼接规则：`source = url | (digest 或 tag) | range`，
/// 然后取 source 的最后 10 个字符接在 source 前面，整体做 sha256。
pub fn task_id(url: &str, meta: &UrlMeta) -> String {
    let mut source = if meta.filter.is_empty() {
        url.to_string()
    } else {
        filter_query_params(url, &meta.filter)
    };

    source.push('|');
    if !meta.digest.is_empty() {
        source.push_str(&meta.digest);
    } else {
        source.push_str(&meta.tag);
    }
    source.push('|');
    source.push_str(&meta.range);

    let chars: Vec<char> = source.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(TAIL_LEN)..].iter().collect();

    sha256_hex(&format!("{tail}{source}"))
}

/// 从 url 上剔除 filter（& 分隔）指定的 query 参数，其余参数保持原有顺序
fn filter_query_params(url: &str, filter: &str) -> String {
    let filters: Vec<&str> = filter.split('&').filter(|f| !f.is_empty()).collect();
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|param| {
            let key = param.split('=').next().unwrap_or(param);
            !filters.contains(&key)
        })
        .collect();

    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}
