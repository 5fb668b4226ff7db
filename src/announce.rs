use std::io::Write;

use chrono::Utc;
use tempfile::NamedTempFile;

use crate::Error;

/// Identity of a connected sender, taken from its announcement product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub wmo_ttaaii: String,
    pub wmo_cccc: String,
    pub source: String,
    pub remotehost: String,
    pub link_id: String,
}

/// Fabricate the announcement product as a temp file. The caller keeps the
/// handle; dropping it removes the file once the product is acknowledged.
pub fn build_announcement(
    ttaaii: &str,
    source: Option<&str>,
    link_id: &str,
) -> Result<NamedTempFile, Error> {
    let ddhhmm = Utc::now().format("%d%H%M");
    let hostname = nix::unistd::gethostname()?;

    let mut file = NamedTempFile::new()?;
    write!(
        file,
        "{ttaaii} {ddhhmm}\r\r\n\nCONNECTION MESSAGE\nSOURCE {}\nLINK {link_id}\nREMOTE {}\n",
        source.unwrap_or("UNKNOWN"),
        hostname.to_string_lossy(),
    )?;
    file.flush()?;
    Ok(file)
}

/// The heading of an announcement payload. The first line carries no CCCC,
/// so the full WMO parser cannot claim it; the first token is the heading.
pub fn announce_ttaaii(payload: &[u8]) -> Option<String> {
    let text = payload
        .iter()
        .skip_while(|b| matches!(**b, 0x01 | b'\r' | b'\n' | b' ' | b'\t'))
        .take_while(|b| b.is_ascii_graphic())
        .map(|b| *b as char)
        .collect::<String>();

    if (4..=6).contains(&text.len()) && text.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Some(text)
    } else {
        None
    }
}

/// Parse an announcement payload: the literal `CONNECTION MESSAGE` line,
/// then `SOURCE`, `LINK` and `REMOTE` key/value pairs in any order. All
/// three keys must carry a value.
pub fn parse_announcement(payload: &[u8], ttaaii: &str) -> Option<ConnInfo> {
    let text = String::from_utf8_lossy(payload);

    let mut lines = text.lines().map(str::trim);
    lines.by_ref().find(|l| *l == "CONNECTION MESSAGE")?;

    let mut source = None;
    let mut link_id = None;
    let mut remotehost = None;

    let mut tokens = lines.flat_map(str::split_whitespace);
    while let Some(key) = tokens.next() {
        match key {
            "SOURCE" => source = tokens.next().map(str::to_owned),
            "LINK" => link_id = tokens.next().map(str::to_owned),
            "REMOTE" => remotehost = tokens.next().map(str::to_owned),
            _ => {}
        }
    }

    Some(ConnInfo {
        wmo_ttaaii: ttaaii.to_owned(),
        wmo_cccc: String::new(),
        source: source?,
        remotehost: remotehost?,
        link_id: link_id?,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn built_announcement_parses() {
        let file = build_announcement("SXUS20", Some("iowa-mesonet"), "5001").unwrap();
        let payload = fs::read(file.path()).unwrap();

        assert_eq!(announce_ttaaii(&payload).as_deref(), Some("SXUS20"));

        let info = parse_announcement(&payload, "SXUS20").unwrap();
        assert_eq!(info.source, "iowa-mesonet");
        assert_eq!(info.link_id, "5001");
        assert!(!info.remotehost.is_empty());
    }

    #[test]
    fn missing_source_defaults_to_unknown() {
        let file = build_announcement("SXUS20", None, "0").unwrap();
        let payload = fs::read(file.path()).unwrap();
        let info = parse_announcement(&payload, "SXUS20").unwrap();
        assert_eq!(info.source, "UNKNOWN");
    }

    #[test]
    fn connection_message_line_is_mandatory() {
        let payload = b"SXUS20 121200\r\r\n\nSOURCE a\nLINK 1\nREMOTE b\n";
        assert!(parse_announcement(payload, "SXUS20").is_none());
    }

    #[test]
    fn all_three_keys_required() {
        let payload = b"SXUS20 121200\r\r\n\nCONNECTION MESSAGE\nSOURCE a\nREMOTE b\n";
        assert!(parse_announcement(payload, "SXUS20").is_none());
    }

    #[test]
    fn heading_extraction_bounds() {
        assert_eq!(announce_ttaaii(b"SXUS20 121200"), Some("SXUS20".into()));
        assert_eq!(announce_ttaaii(b"\x01\r\r\nSXUS20 x"), Some("SXUS20".into()));
        assert_eq!(announce_ttaaii(b"S 1"), None);
        assert_eq!(announce_ttaaii(b"TOOLONGHEADING"), None);
    }
}
