//! `multipart/form-data` 请求体的轻量分帧解析。
//!
//! 只做按边界切分与 `Content-Disposition` 文件名提取，不处理嵌套 multipart，
//! 也不解码 RFC 2231 扩展参数。要求边界串不出现在各部分内容中。

use bytes::Bytes;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

/// 请求体中的一个文件部分，内容与原请求体共享缓冲区。
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field_name: Option<String>,
    pub filename: String,
    pub content: Bytes,
}

/// 从 `Content-Type` 头中提取边界串；媒体类型不是 `multipart/form-data` 时返回 `None`。
pub fn parse_boundary(content_type: &str) -> Option<String> {
    let mut params = split_params(content_type).into_iter();
    let media_type = params.next()?;
    if !media_type.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param_value(&param, "boundary"))
        .find(|boundary| !boundary.is_empty())
}

pub fn is_form_data(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("multipart/form-data"))
}

/// 按 `--boundary` 切分请求体并取出所有带文件名且内容非空的部分。
pub fn parse(body: &Bytes, boundary: &str) -> Vec<FilePart> {
    if body.is_empty() || boundary.is_empty() {
        return Vec::new();
    }
    let delimiter = format!("--{boundary}");
    let segments = split_on(body, delimiter.as_bytes());
    if segments.len() < 3 {
        return Vec::new();
    }

    segments[1..segments.len() - 1]
        .iter()
        .filter_map(|&(start, end)| parse_segment(body, start, end))
        .collect()
}

fn parse_segment(body: &Bytes, start: usize, end: usize) -> Option<FilePart> {
    let segment = &body[start..end];
    let header_end = find(segment, HEADER_SEPARATOR)?;
    let headers = String::from_utf8_lossy(&segment[..header_end]);

    let mut filename = None;
    let mut field_name = None;
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        for param in split_params(value).iter().skip(1) {
            if let Some(value) = param_value(param, "filename") {
                filename = Some(value);
            } else if let Some(value) = param_value(param, "name") {
                field_name = Some(value);
            }
        }
    }

    let filename = filename.filter(|name| !name.is_empty())?;
    let content_start = start + header_end + HEADER_SEPARATOR.len();
    let mut content_end = end;
    if body[content_start..content_end].ends_with(CRLF) {
        content_end -= CRLF.len();
    }
    if content_end <= content_start {
        return None;
    }

    Some(FilePart {
        field_name,
        filename,
        content: body.slice(content_start..content_end),
    })
}

/// 返回分隔符之间各段的 `(start, end)` 区间（含首段前导与末段结尾）。
fn split_on(haystack: &[u8], delimiter: &[u8]) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let mut start = 0;
    while let Some(offset) = find(&haystack[start..], delimiter) {
        segments.push((start, start + offset));
        start += offset + delimiter.len();
    }
    segments.push((start, haystack.len()));
    segments
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// 以分号切分头部参数，引号内的分号保留。
fn split_params(value: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in value.chars() {
        match ch {
            _ if escaped => {
                current.push(ch);
                escaped = false;
            }
            '\\' if in_quotes => {
                current.push(ch);
                escaped = true;
            }
            '"' => {
                current.push(ch);
                in_quotes = !in_quotes;
            }
            ';' if !in_quotes => params.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    params.push(current);
    params
}

/// 参数名匹配时返回去引号后的值。
fn param_value(param: &str, key: &str) -> Option<String> {
    let (name, value) = param.split_once('=')?;
    if !name.trim().eq_ignore_ascii_case(key) {
        return None;
    }
    Some(unquote(value.trim()))
}

fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return value.to_string();
    };
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                result.push(next);
            }
        } else {
            result.push(ch);
        }
    }
    result
}
