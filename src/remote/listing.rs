//! 目录列表解析
//!
//! 同一份原始响应按偏好顺序尝试三种方言：结构化 facts 行、Unix
//! 长列表、裸名清单。前两种直接得到完整条目；裸名清单只有名字，
//! 文件属性由扫描器逐名补查。

use super::{join_remote, RemoteEntry};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::debug;

/// 单行解析结果
enum LineParse {
    /// 有效条目
    Entry(RemoteEntry),
    /// 该方言能识别但应忽略的行（自身/父目录伪条目、total 头等）
    Skip,
    /// 不属于该方言
    NoMatch,
}

/// 一次列表响应的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedListing {
    Entries(Vec<RemoteEntry>),
    /// 裸名清单，需要按名补查大小/类型
    Names(Vec<String>),
}

/// 列表方言解析器
pub struct ListingParser;

impl ListingParser {
    /// 解析一个目录的原始列表响应
    ///
    /// 方言之间按顺序回退；一种方言只要识别出至少一行就被采用，
    /// 识别不了任何行才轮到下一种。全部落空时按裸名清单处理。
    pub fn parse(raw: &str, dir_path: &str) -> ParsedListing {
        let lines: Vec<&str> = raw
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect();

        if lines.is_empty() {
            return ParsedListing::Entries(Vec::new());
        }

        if let Some(entries) = Self::try_dialect(&lines, dir_path, Self::parse_facts_line) {
            return ParsedListing::Entries(entries);
        }
        if let Some(entries) = Self::try_dialect(&lines, dir_path, Self::parse_unix_line) {
            return ParsedListing::Entries(entries);
        }

        let names = lines
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|n| n != "." && n != "..")
            .collect();
        ParsedListing::Names(names)
    }

    fn try_dialect(
        lines: &[&str],
        dir_path: &str,
        parse_line: fn(&str, &str) -> LineParse,
    ) -> Option<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut matched = 0usize;

        for line in lines {
            match parse_line(line, dir_path) {
                LineParse::Entry(entry) => {
                    matched += 1;
                    entries.push(entry);
                }
                LineParse::Skip => matched += 1,
                LineParse::NoMatch => {
                    debug!("列表行不匹配当前方言: {}", line);
                }
            }
        }

        if matched == 0 {
            return None;
        }
        Some(entries)
    }

    /// facts 方言："type=dir;size=0;modify=20231201120000; 名字"
    fn parse_facts_line(line: &str, dir_path: &str) -> LineParse {
        let Some((facts, name)) = line.split_once("; ") else {
            return LineParse::NoMatch;
        };
        let name = name.trim();
        if name.is_empty() {
            return LineParse::Skip;
        }

        let mut entry_type = String::new();
        let mut size = 0u64;
        let mut modified = None;
        let mut known_facts = 0usize;

        for fact in facts.split(';') {
            if fact.is_empty() {
                continue;
            }
            let Some((key, value)) = fact.split_once('=') else {
                return LineParse::NoMatch;
            };
            known_facts += 1;

            match key.trim().to_lowercase().as_str() {
                "type" => entry_type = value.trim().to_lowercase(),
                "size" => size = value.trim().parse().unwrap_or(0),
                "modify" => modified = parse_modify_fact(value.trim()),
                // 其他 facts（perm、unix.mode 等）不参与
                _ => {}
            }
        }

        if known_facts == 0 {
            return LineParse::NoMatch;
        }
        // cdir/pdir 是目录自身和父目录的伪条目
        if entry_type == "cdir" || entry_type == "pdir" || name == "." || name == ".." {
            return LineParse::Skip;
        }

        let is_dir = entry_type == "dir";
        LineParse::Entry(RemoteEntry {
            name: name.to_string(),
            full_path: join_remote(dir_path, name),
            is_dir,
            size: if is_dir { 0 } else { size },
            modified,
        })
    }

    /// Unix 长列表方言："drwxr-xr-x 1 ftp ftp 0 Dec 01 12:00 名字"
    ///
    /// 第 1 列首字符标记类型，第 5 列为大小，第 6-8 列为日期，
    /// 名字是第 8 列之后的行剩余部分（可含空格）。
    fn parse_unix_line(line: &str, dir_path: &str) -> LineParse {
        // 某些服务器的 "total N" 头
        if let Some(rest) = line.strip_prefix("total ") {
            if rest.trim().parse::<u64>().is_ok() {
                return LineParse::Skip;
            }
        }

        if line.len() < 10 {
            return LineParse::NoMatch;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            return LineParse::NoMatch;
        }

        let Some(name) = remainder_after_columns(line, 8) else {
            return LineParse::NoMatch;
        };
        let name = name.trim_end();
        if name.is_empty() {
            return LineParse::NoMatch;
        }
        if name == "." || name == ".." {
            return LineParse::Skip;
        }

        let is_dir = line.starts_with('d');
        let size = if is_dir {
            0
        } else {
            parts[4].parse().unwrap_or(0)
        };
        let modified = parse_unix_date(parts[5], parts[6], parts[7]);

        LineParse::Entry(RemoteEntry {
            name: name.to_string(),
            full_path: join_remote(dir_path, name),
            is_dir,
            size,
            modified,
        })
    }
}

/// facts 的 modify 值：yyyyMMddHHmmss（UTC）
fn parse_modify_fact(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Unix 列表日期："Dec 01 12:00"（近期，取当前年份）或 "Dec 01 2023"
///
/// 解析失败时保持 None，不影响条目本身。
fn parse_unix_date(month: &str, day: &str, rest: &str) -> Option<DateTime<Utc>> {
    let naive = if rest.contains(':') {
        let composed = format!("{} {} {} {}", Utc::now().year(), month, day, rest);
        NaiveDateTime::parse_from_str(&composed, "%Y %b %d %H:%M").ok()?
    } else {
        let composed = format!("{} {} {}", month, day, rest);
        NaiveDate::parse_from_str(&composed, "%b %d %Y")
            .ok()?
            .and_hms_opt(0, 0, 0)?
    };
    Some(Utc.from_utc_datetime(&naive))
}

/// 行中第 count 列之后的剩余部分（列按连续空白分隔）
fn remainder_after_columns(line: &str, count: usize) -> Option<&str> {
    let mut columns = 0usize;
    let mut in_whitespace = true;

    for (idx, ch) in line.char_indices() {
        if ch.is_whitespace() {
            in_whitespace = true;
        } else if in_whitespace {
            in_whitespace = false;
            columns += 1;
            if columns == count + 1 {
                return Some(&line[idx..]);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_facts_dialect() {
        let raw = "type=cdir;modify=20231201120000; .\r\n\
                   type=pdir;modify=20231201120000; ..\r\n\
                   type=dir;size=0;modify=20231201120000; @CUP Terrains\r\n\
                   type=file;size=1048576;modify=20231201093000; mod.pbo\r\n";

        let ParsedListing::Entries(entries) = ListingParser::parse(raw, "/mods") else {
            panic!("facts 方言未被识别");
        };

        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].name, "@CUP Terrains");
        assert_eq!(entries[0].full_path, "/mods/@CUP Terrains");
        assert!(!entries[1].is_dir);
        assert_eq!(entries[1].size, 1048576);
        let modified = entries[1].modified.expect("modify 应可解析");
        assert_eq!(modified.hour(), 9);
    }

    #[test]
    fn test_facts_bad_date_keeps_entry() {
        let raw = "type=file;size=5;modify=notadate; a.txt\n";
        let ParsedListing::Entries(entries) = ListingParser::parse(raw, "/") else {
            panic!("facts 方言未被识别");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 5);
        assert!(entries[0].modified.is_none());
    }

    #[test]
    fn test_unix_dialect_fallback() {
        // facts 解析失败后应回退到 Unix 方言
        let raw = "total 2\r\n\
                   drwxr-xr-x   2 ftp  ftp         0 Dec 01 12:00 @ACE\r\n\
                   -rw-r--r--   1 ftp  ftp   2097152 Dec 01  2023 ace_main.pbo\r\n";

        let ParsedListing::Entries(entries) = ListingParser::parse(raw, "/") else {
            panic!("Unix 方言未被识别");
        };

        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[0].full_path, "/@ACE");
        assert!(!entries[1].is_dir);
        assert_eq!(entries[1].size, 2097152);
        assert!(entries[1].modified.is_some());
    }

    #[test]
    fn test_unix_name_with_spaces() {
        let raw = "-rw-r--r--   1 ftp  ftp   100 Dec 01 12:00 @CUP Weapons Pack\n";
        let ParsedListing::Entries(entries) = ListingParser::parse(raw, "/") else {
            panic!("Unix 方言未被识别");
        };
        assert_eq!(entries[0].name, "@CUP Weapons Pack");
    }

    #[test]
    fn test_bare_names_dialect() {
        let raw = ".\n..\n@ACE\nreadme.txt\n";
        let parsed = ListingParser::parse(raw, "/");
        assert_eq!(
            parsed,
            ParsedListing::Names(vec!["@ACE".to_string(), "readme.txt".to_string()])
        );
    }

    #[test]
    fn test_empty_listing() {
        assert_eq!(
            ListingParser::parse("", "/"),
            ParsedListing::Entries(Vec::new())
        );
        assert_eq!(
            ListingParser::parse("total 0\r\n", "/"),
            ParsedListing::Entries(Vec::new())
        );
    }
}
