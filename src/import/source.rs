use super::ImportError;
use encoding_rs::Encoding;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Semicolon,
    Tab,
    Colon,
    /// Whatever the workspace has configured.
    Cfg,
}

impl Delimiter {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "comma" => Some(Self::Comma),
            "semicolon" => Some(Self::Semicolon),
            "tab" => Some(Self::Tab),
            "colon" => Some(Self::Colon),
            "cfg" => Some(Self::Cfg),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Comma => "comma",
            Self::Semicolon => "semicolon",
            Self::Tab => "tab",
            Self::Colon => "colon",
            Self::Cfg => "cfg",
        }
    }

    pub fn resolve(self, configured: Delimiter) -> char {
        match self {
            Self::Comma => ',',
            Self::Semicolon => ';',
            Self::Tab => '\t',
            Self::Colon => ':',
            Self::Cfg if configured == Self::Cfg => ',',
            Self::Cfg => configured.resolve(Self::Comma),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based line number in the uploaded text.
    pub line: usize,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawTable {
    pub header: Vec<String>,
    pub rows: Vec<RawRow>,
}

pub fn encoding_for_label(label: &str) -> Result<&'static Encoding, ImportError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| ImportError::UnknownEncoding(label.trim().to_string()))
}

pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> Result<String, ImportError> {
    let (text, had_errors) = encoding.decode_with_bom_removal(bytes);
    if had_errors {
        return Err(ImportError::Malformed(encoding.name().to_string()));
    }
    Ok(text.into_owned())
}

/// Decodes an upload and splits it into a header and data rows.
pub fn load(
    bytes: &[u8],
    encoding: &'static Encoding,
    delimiter: char,
    max_bytes: usize,
) -> Result<RawTable, ImportError> {
    if bytes.len() > max_bytes {
        return Err(ImportError::UploadTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    let text = decode(bytes, encoding)?;
    read_table(&text, delimiter)
}

pub fn read_table(text: &str, delimiter: char) -> Result<RawTable, ImportError> {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    for RawRow { line, fields } in split_records(&text, delimiter) {
        if fields.len() == 1 && fields[0].trim().is_empty() {
            continue;
        }
        match header.as_ref() {
            None => header = Some(fields),
            Some(h) => {
                if fields.len() != h.len() {
                    return Err(ImportError::ColumnCount {
                        line,
                        expected: h.len(),
                        found: fields.len(),
                    });
                }
                rows.push(RawRow { line, fields });
            }
        }
    }

    let Some(header) = header else {
        return Err(ImportError::EmptyFile);
    };
    if rows.is_empty() {
        return Err(ImportError::NoData);
    }
    Ok(RawTable { header, rows })
}

/// Splits LF-separated text into records. Quotes group delimiters and line
/// breaks; a doubled quote inside quotes is a literal quote. Each record
/// carries the line it starts on.
fn split_records(text: &str, delimiter: char) -> Vec<RawRow> {
    let mut out = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut start = 1;
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            '\n' if in_quotes => {
                buf.push('\n');
                line += 1;
            }
            '\n' => {
                fields.push(std::mem::take(&mut buf));
                out.push(RawRow {
                    line: start,
                    fields: std::mem::take(&mut fields),
                });
                line += 1;
                start = line;
            }
            c if c == delimiter && !in_quotes => fields.push(std::mem::take(&mut buf)),
            c => buf.push(c),
        }
    }
    if !buf.is_empty() || !fields.is_empty() {
        fields.push(buf);
        out.push(RawRow {
            line: start,
            fields,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_quotes_and_escaped_quotes() {
        let records = split_records(r#"Alpha,"Desc, with comma","say ""hi""""#, ',');
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields, vec!["Alpha", "Desc, with comma", r#"say "hi""#]);
    }

    #[test]
    fn quoted_line_break_stays_in_field() {
        let t = read_table(
            "groupname,description\r\nAlpha,\"line one\r\nline two\"\r\nBeta,plain\r\n",
            ',',
        )
        .expect("table");
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[0].line, 2);
        assert_eq!(t.rows[0].fields, vec!["Alpha", "line one\nline two"]);
        assert_eq!(t.rows[1].line, 4);
        assert_eq!(t.rows[1].fields, vec!["Beta", "plain"]);
    }

    #[test]
    fn cfg_delimiter_follows_configuration() {
        assert_eq!(Delimiter::Cfg.resolve(Delimiter::Semicolon), ';');
        assert_eq!(Delimiter::Cfg.resolve(Delimiter::Cfg), ',');
        assert_eq!(Delimiter::Tab.resolve(Delimiter::Semicolon), '\t');
        assert_eq!(Delimiter::parse(" Colon "), Some(Delimiter::Colon));
        assert_eq!(Delimiter::parse("pipe"), None);
    }

    #[test]
    fn read_table_skips_blank_lines_and_keeps_line_numbers() {
        let t = read_table("groupname;member\r\n\r\nAlpha;ada\rBeta;bob\n", ';').expect("table");
        assert_eq!(t.header, vec!["groupname", "member"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[0].line, 3);
        assert_eq!(t.rows[1].line, 4);
        assert_eq!(t.rows[1].fields, vec!["Beta", "bob"]);
    }

    #[test]
    fn empty_and_header_only_files_fail() {
        assert!(matches!(read_table("\n \n", ','), Err(ImportError::EmptyFile)));
        assert!(matches!(read_table("groupname\n", ','), Err(ImportError::NoData)));
    }

    #[test]
    fn column_count_mismatch_names_line() {
        let err = read_table("groupname,member\nAlpha\n", ',').unwrap_err();
        match err {
            ImportError::ColumnCount {
                line,
                expected,
                found,
            } => {
                assert_eq!((line, expected, found), (2, 2, 1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn latin1_upload_decodes_with_selected_encoding() {
        let bytes = b"groupname\nCaf\xe9\n";
        let latin1 = encoding_for_label("ISO-8859-1").expect("label");
        let t = load(bytes, latin1, ',', 1024).expect("latin1");
        assert_eq!(t.rows[0].fields[0], "Café");

        let utf8 = encoding_for_label("UTF-8").expect("label");
        assert!(matches!(load(bytes, utf8, ',', 1024), Err(ImportError::Malformed(_))));
    }

    #[test]
    fn oversized_upload_is_rejected_before_decoding() {
        let utf8 = encoding_for_label("utf-8").expect("label");
        let err = load(b"groupname\nAlpha\n", utf8, ',', 4).unwrap_err();
        assert!(matches!(err, ImportError::UploadTooLarge { size: 16, max: 4 }));
        assert!(matches!(
            encoding_for_label("klingon"),
            Err(ImportError::UnknownEncoding(_))
        ));
    }
}
