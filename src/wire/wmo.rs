/// How far into the payload the heading is searched for.
pub const WMO_SCAN_LEN: usize = 1024;

/// A parsed WMO heading, `TTAAII CCCC DDHHMM [BBB]` optionally followed by
/// an `NNNXXX` line. Fields the payload does not carry stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WmoHeading {
    pub ttaaii: String,
    pub cccc: String,
    pub ddhhmm: String,
    pub bbb: String,
    pub nnnxxx: String,
}

struct Scan<'a> {
    s: &'a [u8],
    p: usize,
}

impl<'a> Scan<'a> {
    fn skip_noise(&mut self) {
        while self.p < self.s.len()
            && matches!(self.s[self.p], 0x01 | 0x03 | b'\r' | b'\n' | b' ' | b'\t')
        {
            self.p += 1;
        }
    }

    fn skip_spaces(&mut self) {
        while self.p < self.s.len() && matches!(self.s[self.p], b' ' | b'\t') {
            self.p += 1;
        }
    }

    fn token(&mut self) -> &'a [u8] {
        let start = self.p;
        while self.p < self.s.len()
            && !matches!(self.s[self.p], 0x01 | 0x03 | b'\r' | b'\n' | b' ' | b'\t')
        {
            self.p += 1;
        }
        &self.s[start..self.p]
    }

    fn at_eol(&self) -> bool {
        self.p >= self.s.len() || matches!(self.s[self.p], b'\r' | b'\n' | 0x03)
    }

    fn next_line(&mut self) {
        while self.p < self.s.len() && !matches!(self.s[self.p], b'\r' | b'\n') {
            self.p += 1;
        }
        while self.p < self.s.len() && matches!(self.s[self.p], b'\r' | b'\n') {
            self.p += 1;
        }
    }
}

fn all_alpha(t: &[u8]) -> bool {
    !t.is_empty() && t.iter().all(u8::is_ascii_alphabetic)
}

fn all_digit(t: &[u8]) -> bool {
    !t.is_empty() && t.iter().all(u8::is_ascii_digit)
}

fn all_alnum(t: &[u8]) -> bool {
    !t.is_empty() && t.iter().all(u8::is_ascii_alphanumeric)
}

fn to_string(t: &[u8]) -> String {
    String::from_utf8_lossy(t).into_owned()
}

/// Tolerantly parse a WMO heading from the first bytes of a payload.
///
/// Accepted `TTAAII` spacings: `TTAAII `, `TTAAI C`, `TTAA I `, `TTAAIC`,
/// plus a no-`ii` fallback that synthesizes `ii = 00`. The date/time group
/// may be 4 or 6 digits (4 digits gain `00` minutes) with an optional
/// trailing `Z`. `BBB` is at most three alphabetics; longer groups are
/// dropped silently. An `NNNXXX` of 4-6 alphanumerics is taken only when it
/// stands alone on the following line.
///
/// Returns `None` only when no `CCCC` can be located.
pub fn parse_wmo(buf: &[u8]) -> Option<WmoHeading> {
    let n = buf.len().min(WMO_SCAN_LEN);
    let mut sc = Scan { s: &buf[..n], p: 0 };
    sc.skip_noise();

    // A leading transmission sequence line (digits alone) is not the heading.
    {
        let save = sc.p;
        let t = sc.token();
        if all_digit(t) && sc.at_eol() {
            sc.next_line();
        } else {
            sc.p = save;
        }
    }

    let mut h = WmoHeading::default();

    let t1 = sc.token();
    let alpha = t1.iter().take_while(|b| b.is_ascii_alphabetic()).count();
    if alpha != 4 {
        return None;
    }

    // Bytes of the CCCC glued onto the TTAAII token, if any.
    let mut glued: &[u8] = &[];

    match t1.len() {
        4 => {
            // "TTAA I " or the no-ii fallback.
            sc.skip_spaces();
            let save = sc.p;
            let t2 = sc.token();
            if all_digit(t2) && t2.len() <= 2 {
                h.ttaaii = format!("{}{:0>2}", to_string(&t1[..4]), to_string(t2));
            } else {
                sc.p = save;
                h.ttaaii = format!("{}00", to_string(t1));
            }
        }
        5 if t1[4].is_ascii_digit() => {
            // "TTAAI C"
            h.ttaaii = format!("{}0{}", to_string(&t1[..4]), t1[4] as char);
        }
        6 if t1[4].is_ascii_digit() && t1[5].is_ascii_digit() => {
            // "TTAAII "
            h.ttaaii = to_string(t1);
        }
        _ if t1.len() > 5 && t1[4].is_ascii_digit() && t1[5].is_ascii_alphabetic() => {
            // "TTAAIC" — the CCCC follows without a separator.
            h.ttaaii = format!("{}0{}", to_string(&t1[..4]), t1[4] as char);
            glued = &t1[5..];
        }
        _ => return None,
    }

    let cccc = if glued.is_empty() {
        sc.skip_spaces();
        sc.token()
    } else {
        glued
    };
    if cccc.len() != 4 || !all_alpha(cccc) {
        return None;
    }
    h.cccc = to_string(cccc);

    sc.skip_spaces();
    let save = sc.p;
    let mut dt = sc.token();
    if let [head @ .., b'Z' | b'z'] = dt {
        dt = head;
    }
    if all_digit(dt) && dt.len() == 6 {
        h.ddhhmm = to_string(dt);
    } else if all_digit(dt) && dt.len() == 4 {
        h.ddhhmm = format!("{}00", to_string(dt));
    } else {
        // CCCC was located; the rest of the heading is simply absent.
        sc.p = save;
        return Some(h);
    }

    sc.skip_spaces();
    if !sc.at_eol() {
        let t = sc.token();
        if all_alpha(t) && t.len() <= 3 {
            h.bbb = to_string(t);
        }
        // Longer or mixed groups are dropped without complaint.
    }

    sc.next_line();
    let t = sc.token();
    if (4..=6).contains(&t.len()) && all_alnum(t) {
        sc.skip_spaces();
        if sc.at_eol() {
            h.nnnxxx = to_string(t);
        }
    }

    Some(h)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(s: &str) -> WmoHeading {
        parse_wmo(s.as_bytes()).expect("heading should parse")
    }

    #[test]
    fn canonical_heading() {
        let h = parse("SXUS20 KWBC 121200\r\r\n");
        assert_eq!(h.ttaaii, "SXUS20");
        assert_eq!(h.cccc, "KWBC");
        assert_eq!(h.ddhhmm, "121200");
        assert_eq!(h.bbb, "");
        assert_eq!(h.nnnxxx, "");
    }

    #[test]
    fn single_digit_ii_is_zero_padded() {
        assert_eq!(parse("SXUS2 KWBC 121200\r\r\n").ttaaii, "SXUS02");
    }

    #[test]
    fn detached_ii_group() {
        let h = parse("SXUS 2 KWBC 121200\r\r\n");
        assert_eq!(h.ttaaii, "SXUS02");
        assert_eq!(h.cccc, "KWBC");
    }

    #[test]
    fn missing_ii_synthesized() {
        let h = parse("SXUS KWBC 121200\r\r\n");
        assert_eq!(h.ttaaii, "SXUS00");
        assert_eq!(h.cccc, "KWBC");
    }

    #[test]
    fn glued_cccc() {
        let h = parse("SXUS2KWBC 121200\r\r\n");
        assert_eq!(h.ttaaii, "SXUS02");
        assert_eq!(h.cccc, "KWBC");
    }

    #[test]
    fn four_digit_time_gains_minutes() {
        assert_eq!(parse("SXUS20 KWBC 1212\r\r\n").ddhhmm, "121200");
    }

    #[test]
    fn trailing_z_stripped() {
        assert_eq!(parse("SXUS20 KWBC 121200Z\r\r\n").ddhhmm, "121200");
    }

    #[test]
    fn bbb_taken_when_short() {
        let h = parse("SXUS20 KWBC 121200 RRA\r\r\n");
        assert_eq!(h.bbb, "RRA");
    }

    #[test]
    fn four_letter_bbb_dropped() {
        let h = parse("SXUS20 KWBC 121200 CCAA\r\r\n");
        assert_eq!(h.bbb, "");
    }

    #[test]
    fn nnnxxx_alone_on_line() {
        let h = parse("SXUS20 KWBC 121200\r\r\nMETAR\r\r\nbody");
        assert_eq!(h.nnnxxx, "METAR");
    }

    #[test]
    fn nnnxxx_with_company_rejected() {
        let h = parse("SXUS20 KWBC 121200\r\r\nMETAR KORD\r\r\n");
        assert_eq!(h.nnnxxx, "");
    }

    #[test]
    fn nnnxxx_length_bounds() {
        assert_eq!(parse("SXUS20 KWBC 121200\r\r\nABC\r\r\n").nnnxxx, "");
        assert_eq!(parse("SXUS20 KWBC 121200\r\r\nABCDEFG\r\r\n").nnnxxx, "");
        assert_eq!(parse("SXUS20 KWBC 121200\r\r\nAB12\r\r\n").nnnxxx, "AB12");
    }

    #[test]
    fn missing_cccc_fails() {
        assert!(parse_wmo(b"12345 6789\r\r\n").is_none());
        assert!(parse_wmo(b"").is_none());
        assert!(parse_wmo(b"HELLO WORLD\r\r\n").is_none());
    }

    #[test]
    fn heading_without_time_still_parses() {
        let h = parse("SXUS20 KWBC\r\r\n");
        assert_eq!(h.cccc, "KWBC");
        assert_eq!(h.ddhhmm, "");
    }

    #[test]
    fn lowercase_accepted() {
        let h = parse("sxus20 kwbc 121200\r\r\n");
        assert_eq!(h.ttaaii, "sxus20");
        assert_eq!(h.cccc, "kwbc");
    }

    #[test]
    fn leading_control_and_sequence_line_skipped() {
        let h = parse("\x01\r\r\n123\r\r\nSXUS20 KWBC 121200\r\r\n");
        assert_eq!(h.ttaaii, "SXUS20");
    }
}
