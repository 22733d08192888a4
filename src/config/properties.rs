//! 扁平 key-value 配置文件解析
//!
//! 兼容常见的 properties 写法：`key=value`、`key: value`、`key value`，
//! `#` 或 `!` 开头的注释行，行尾 `\` 续行。

use std::collections::BTreeMap;

/// 解析 properties 文本，返回按键排序的键值表
///
/// 同一个键出现多次时，后出现的值覆盖前面的值。
pub fn parse(input: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();

    for line in logical_lines(input) {
        let (key, value) = split_entry(&line);
        if key.is_empty() {
            continue;
        }
        entries.insert(key, value);
    }

    entries
}

/// 合并续行并过滤空行和注释
fn logical_lines(input: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut continuing = false;

    for raw in input.lines() {
        let trimmed = raw.trim_start();

        if !continuing && (trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!'))
        {
            continue;
        }

        if ends_with_continuation(trimmed) {
            current.push_str(&trimmed[..trimmed.len() - 1]);
            continuing = true;
        } else {
            current.push_str(trimmed);
            lines.push(std::mem::take(&mut current));
            continuing = false;
        }
    }

    if !current.is_empty() {
        lines.push(current);
    }

    lines
}

/// 行尾是否为未转义的反斜杠（奇数个）
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

/// 拆分键和值，处理转义字符
fn split_entry(line: &str) -> (String, String) {
    let mut key = String::new();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    key.push(unescape(escaped));
                }
            }
            '=' | ':' => break,
            c if c.is_whitespace() => {
                // 空白之后还允许出现一个 '=' 或 ':'
                while chars.peek().is_some_and(|c| c.is_whitespace()) {
                    chars.next();
                }
                if matches!(chars.peek(), Some('=') | Some(':')) {
                    chars.next();
                }
                break;
            }
            c => key.push(c),
        }
    }

    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }

    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                value.push(unescape(escaped));
            }
        } else {
            value.push(c);
        }
    }

    (key, value.trim_end().to_string())
}

fn unescape(c: char) -> char {
    match c {
        't' => '\t',
        'n' => '\n',
        'r' => '\r',
        'f' => '\u{c}',
        other => other,
    }
}
