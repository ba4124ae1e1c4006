//! The S/Y parameter exchange.
//!
//! Both init packets carry the same positional field list: `MAXL TIME NPAD
//! PADC EOL QCTL QBIN CHK REPT CAPAS WINDO MAXLX1 MAXLX2`. Absent trailing
//! fields keep their defaults, which is what keeps ancient implementations
//! interoperable.

use std::time::Duration;

use super::{
    constants::{
        capas, CR, DEFAULT_MAX_LONG_PACKET_LEN, DEFAULT_QCTL, DEFAULT_REPT,
        DEFAULT_TIMEOUT_SECS, MAX_SHORT_PACKET_LEN,
    },
    packet::{ctl, tochar, unchar, CheckType, Encoding},
};
use crate::options::KermitOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KermitParameters {
    /// Largest short packet this side can receive.
    pub max_packet_len: usize,
    pub timeout_secs: u8,
    pub npad: u8,
    pub padc: u8,
    pub eol: u8,
    pub qctl: u8,
    /// ' ' = no eighth bit quoting, 'Y' = will if asked, 'N' = refuse,
    /// anything else is the requested prefix character.
    pub qbin: u8,
    pub check_type: CheckType,
    /// ' ' = no repeat counts, otherwise the repeat prefix character.
    pub rept: u8,
    pub capabilities: u8,
    pub window_size: u8,
    pub max_long_packet_len: usize,
}

impl Default for KermitParameters {
    fn default() -> Self {
        Self {
            max_packet_len: MAX_SHORT_PACKET_LEN,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            npad: 0,
            padc: 0,
            eol: CR,
            qctl: DEFAULT_QCTL,
            qbin: b'Y',
            check_type: CheckType::Crc,
            rept: DEFAULT_REPT,
            capabilities: capas::LONG_PACKETS | capas::ATTRIBUTES,
            window_size: 1,
            max_long_packet_len: DEFAULT_MAX_LONG_PACKET_LEN,
        }
    }
}

impl KermitParameters {
    /// The parameter set we advertise, shaped by the transfer options.
    pub fn from_options(options: &KermitOptions) -> Self {
        let mut params = Self::default();
        if !options.long_packets {
            params.capabilities &= !capas::LONG_PACKETS;
        }
        if options.streaming {
            params.capabilities |= capas::STREAMING;
        }
        params.window_size = options.effective_window_size();
        if params.window_size > 1 {
            params.capabilities |= capas::SLIDING_WINDOW;
        }
        params
    }

    /// Data field of an S or Y packet.
    pub fn to_data(&self) -> Vec<u8> {
        let maxlx = self.max_long_packet_len.min(94 * 95 + 94);
        vec![
            tochar(self.max_packet_len.min(MAX_SHORT_PACKET_LEN) as u8),
            tochar(self.timeout_secs),
            tochar(self.npad),
            ctl(self.padc),
            tochar(self.eol),
            self.qctl,
            self.qbin,
            self.check_type.wire_byte(),
            self.rept,
            tochar(self.capabilities),
            tochar(self.window_size),
            tochar((maxlx / 95) as u8),
            tochar((maxlx % 95) as u8),
        ]
    }

    /// Parse an S or Y data field. Short fields are legal; everything that
    /// is missing stays at its default.
    pub fn from_data(data: &[u8]) -> Self {
        let mut params = Self {
            // A peer that doesn't mention a capability doesn't have it.
            qbin: b' ',
            rept: b' ',
            capabilities: 0,
            check_type: CheckType::Sum6,
            ..Self::default()
        };
        let mut fields = data.iter().copied();
        if let Some(maxl) = fields.next() {
            params.max_packet_len = usize::from(unchar(maxl)).min(MAX_SHORT_PACKET_LEN);
        }
        if let Some(time) = fields.next() {
            params.timeout_secs = unchar(time);
        }
        if let Some(npad) = fields.next() {
            params.npad = unchar(npad);
        }
        if let Some(padc) = fields.next() {
            params.padc = ctl(padc);
        }
        if let Some(eol) = fields.next() {
            params.eol = unchar(eol);
        }
        if let Some(qctl) = fields.next() {
            params.qctl = qctl;
        }
        if let Some(qbin) = fields.next() {
            params.qbin = qbin;
        }
        if let Some(chk) = fields.next() {
            params.check_type = CheckType::from_wire_byte(chk);
        }
        if let Some(rept) = fields.next() {
            params.rept = rept;
        }
        if let Some(capabilities) = fields.next() {
            params.capabilities = unchar(capabilities);
        }
        if let Some(windo) = fields.next() {
            params.window_size = unchar(windo).max(1);
        }
        let maxlx1 = fields.next();
        let maxlx2 = fields.next();
        if let (Some(x1), Some(x2)) = (maxlx1, maxlx2) {
            params.max_long_packet_len =
                usize::from(unchar(x1)) * 95 + usize::from(unchar(x2));
        }
        params
    }
}

/// Both halves of the negotiation, and the rules that combine them.
#[derive(Debug, Clone, Copy)]
pub struct TransferParameters {
    pub local: KermitParameters,
    pub remote: KermitParameters,
}

/// The parameters actually governing the session after the S/Y exchange.
#[derive(Debug, Clone, Copy)]
pub struct ActiveParameters {
    /// Largest data field we may put into a packet we send.
    pub max_packet_len: usize,
    pub max_long_packet_len: usize,
    pub long_packets: bool,
    pub streaming: bool,
    pub attributes: bool,
    pub window_size: u8,
    pub timeout: Duration,
    /// Padding and line end for packets we transmit.
    pub npad: u8,
    pub padc: u8,
    pub eol: u8,
    pub check_type: CheckType,
    /// Eighth bit prefix in force, if any.
    pub qbin: Option<u8>,
    /// Repeat prefix in force, if any.
    pub rept: Option<u8>,
}

impl TransferParameters {
    pub fn new(local: KermitParameters, remote: KermitParameters) -> Self {
        Self { local, remote }
    }

    pub fn active(&self) -> ActiveParameters {
        let capabilities = self.local.capabilities & self.remote.capabilities;
        let long_packets = capabilities & capas::LONG_PACKETS != 0;

        // Eighth bit quoting happens when one side requests a prefix char
        // and the other is willing ('Y'), or both name the same char.
        let qbin = match (self.local.qbin, self.remote.qbin) {
            (b'Y', b'Y') | (b'N', _) | (_, b'N') | (b' ', _) | (_, b' ') => None,
            (b'Y', ch) | (ch, b'Y') => Some(ch),
            (l, r) if l == r => Some(l),
            _ => None,
        };
        let qbin = qbin.filter(|&ch| (33..=62).contains(&ch) || (96..=126).contains(&ch));

        let rept = if self.local.rept == self.remote.rept && self.local.rept != b' ' {
            Some(self.local.rept)
        } else {
            None
        };

        let check_type = if self.local.check_type == self.remote.check_type {
            self.remote.check_type
        } else {
            CheckType::Sum6
        };

        ActiveParameters {
            max_packet_len: self.remote.max_packet_len,
            max_long_packet_len: self
                .remote
                .max_long_packet_len
                .min(self.local.max_long_packet_len),
            long_packets,
            streaming: capabilities & capas::STREAMING != 0,
            attributes: capabilities & capas::ATTRIBUTES != 0,
            window_size: self.local.window_size.min(self.remote.window_size).max(1),
            timeout: Duration::from_secs(u64::from(self.remote.timeout_secs.max(1))),
            npad: self.remote.npad,
            padc: self.remote.padc,
            eol: if self.remote.eol == 0 { CR } else { self.remote.eol },
            check_type,
            qbin,
            rept,
        }
    }

    /// Encoding for the data we transmit: our control prefix, the shared
    /// eighth bit and repeat prefixes.
    pub fn tx_encoding(&self) -> Encoding {
        let active = self.active();
        Encoding {
            qctl: self.local.qctl,
            qbin: active.qbin,
            rept: active.rept,
        }
    }

    /// Encoding for the data we receive, keyed by the remote's control
    /// prefix.
    pub fn rx_encoding(&self) -> Encoding {
        let active = self.active();
        Encoding {
            qctl: self.remote.qctl,
            qbin: active.qbin,
            rept: active.rept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::constants::DEFAULT_QBIN;
    use super::*;

    #[test]
    fn init_data_roundtrip() {
        let params = KermitParameters::default();
        let parsed = KermitParameters::from_data(&params.to_data());
        assert_eq!(params, parsed);
    }

    #[test]
    fn short_init_data_keeps_defaults() {
        // An ancient implementation sending only MAXL and TIME.
        let params = KermitParameters::from_data(&[tochar(80), tochar(5)]);
        assert_eq!(80, params.max_packet_len);
        assert_eq!(5, params.timeout_secs);
        assert_eq!(CR, params.eol);
        assert_eq!(CheckType::Sum6, params.check_type);
        assert_eq!(0, params.capabilities);
    }

    #[test]
    fn long_packets_and_crc_negotiated() {
        let mut local = KermitParameters::default();
        local.max_long_packet_len = 9024;
        let mut remote = KermitParameters::default();
        remote.max_long_packet_len = 9024;
        let active = TransferParameters::new(local, remote).active();
        assert!(active.long_packets);
        assert_eq!(9024, active.max_long_packet_len);
        assert_eq!(CheckType::Crc, active.check_type);
    }

    #[test]
    fn check_type_falls_back_on_disagreement() {
        let local = KermitParameters::default();
        let remote = KermitParameters {
            check_type: CheckType::Sum12,
            ..KermitParameters::default()
        };
        let active = TransferParameters::new(local, remote).active();
        assert_eq!(CheckType::Sum6, active.check_type);
    }

    #[test]
    fn qbin_requires_one_side_to_ask() {
        let both_willing = TransferParameters::new(
            KermitParameters::default(),
            KermitParameters::default(),
        );
        assert_eq!(None, both_willing.active().qbin);

        let asking = KermitParameters {
            qbin: DEFAULT_QBIN,
            ..KermitParameters::default()
        };
        let negotiated = TransferParameters::new(asking, KermitParameters::default());
        assert_eq!(Some(DEFAULT_QBIN), negotiated.active().qbin);
    }

    #[test]
    fn streaming_needs_both_sides() {
        let streaming = KermitParameters {
            capabilities: capas::LONG_PACKETS | capas::STREAMING,
            ..KermitParameters::default()
        };
        let plain = KermitParameters::default();
        assert!(!TransferParameters::new(streaming, plain).active().streaming);
        assert!(TransferParameters::new(streaming, streaming).active().streaming);
    }
}
