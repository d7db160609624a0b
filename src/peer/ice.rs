use crate::error::CandidateError;
use crate::peer::types::IceCandidate;

const CANDIDATE_PREFIX: &str = "candidate:";

/// The fields of an `a=candidate` line that we look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLine {
    pub foundation: String,
    pub component: u16,
    pub transport: String,
    pub priority: Option<u32>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub kind: Option<String>,
}

/// Parses a candidate string with or without its `candidate:` prefix.
pub fn parse_candidate(raw: &str) -> Result<CandidateLine, CandidateError> {
    let body = raw.trim();
    let body = body.strip_prefix(CANDIDATE_PREFIX).unwrap_or(body).trim();
    if body.is_empty() {
        return Err(CandidateError::Empty);
    }

    let malformed = || CandidateError::Malformed(raw.to_string());
    let fields: Vec<&str> = body.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(malformed());
    }

    let component = fields[1].parse::<u16>().map_err(|_| malformed())?;
    let kind = fields
        .iter()
        .position(|f| *f == "typ")
        .and_then(|i| fields.get(i + 1))
        .map(|k| k.to_string());

    Ok(CandidateLine {
        foundation: fields[0].to_string(),
        component,
        transport: fields[2].to_string(),
        priority: fields.get(3).and_then(|p| p.parse().ok()),
        address: fields.get(4).map(|a| a.to_string()),
        port: fields.get(5).and_then(|p| p.parse().ok()),
        kind,
    })
}

/// Validates a remote candidate and rebuilds it in canonical `candidate:` form,
/// keeping its media-section alignment.
pub fn normalize_candidate(
    data: &IceCandidate,
) -> Result<(IceCandidate, CandidateLine), CandidateError> {
    let line = parse_candidate(&data.candidate)?;
    let body = data.candidate.trim();
    let body = body.strip_prefix(CANDIDATE_PREFIX).unwrap_or(body).trim();

    let candidate = IceCandidate {
        candidate: format!("{CANDIDATE_PREFIX}{body}"),
        sdp_mid: data.sdp_mid.clone(),
        sdp_mline_index: data.sdp_mline_index,
        username_fragment: data.username_fragment.clone(),
    };
    Ok((candidate, line))
}

/// Running count of remote candidate types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, line: &CandidateLine) {
        match line.kind.as_deref() {
            Some("host") => self.host += 1,
            Some("srflx") | Some("prflx") => self.srflx += 1,
            Some("relay") => self.relay += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log_summary(&self) {
        log::info!(
            "candidate analysis: {} host, {} srflx, {} relay, {} other",
            self.host,
            self.srflx,
            self.relay,
            self.other
        );
        if self.total() > 0 && self.relay == 0 {
            log::warn!("no TURN relay candidates seen; peers behind strict NAT may not connect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefix_and_keeps_alignment() {
        let data = IceCandidate {
            candidate: "candidate:1 1 UDP 2122252543 192.168.1.7 54400 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let (candidate, line) = normalize_candidate(&data).unwrap();
        assert_eq!(
            candidate.candidate,
            "candidate:1 1 UDP 2122252543 192.168.1.7 54400 typ host"
        );
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(line.component, 1);
        assert_eq!(line.port, Some(54400));
        assert_eq!(line.kind.as_deref(), Some("host"));
    }

    #[test]
    fn unprefixed_candidate_is_canonicalized() {
        let data = IceCandidate {
            candidate: "842163049 1 udp 1677729535 203.0.113.9 3478 typ srflx raddr 0.0.0.0 rport 0"
                .into(),
            ..Default::default()
        };
        let (candidate, line) = normalize_candidate(&data).unwrap();
        assert!(candidate.candidate.starts_with("candidate:842163049 "));
        assert_eq!(line.kind.as_deref(), Some("srflx"));
    }

    #[test]
    fn truncated_candidate_still_parses() {
        let line = parse_candidate("candidate:1 1 UDP ...").unwrap();
        assert_eq!(line.transport, "UDP");
        assert_eq!(line.priority, None);
    }

    #[test]
    fn empty_and_garbage_are_rejected() {
        assert_eq!(parse_candidate(""), Err(CandidateError::Empty));
        assert_eq!(parse_candidate("candidate:"), Err(CandidateError::Empty));
        assert!(matches!(
            parse_candidate("candidate:abc x udp"),
            Err(CandidateError::Malformed(_))
        ));
        assert!(matches!(
            parse_candidate("garbage"),
            Err(CandidateError::Malformed(_))
        ));
    }

    #[test]
    fn tally_counts_types() {
        let mut tally = CandidateTally::default();
        for raw in [
            "1 1 udp 1 10.0.0.1 1 typ host",
            "2 1 udp 1 1.2.3.4 2 typ srflx",
            "3 1 udp 1 5.6.7.8 3 typ relay",
            "4 1 udp 1 5.6.7.8 3",
        ] {
            tally.record(&parse_candidate(raw).unwrap());
        }
        assert_eq!(
            tally,
            CandidateTally {
                host: 1,
                srflx: 1,
                relay: 1,
                other: 1
            }
        );
        assert_eq!(tally.total(), 4);
    }
}
