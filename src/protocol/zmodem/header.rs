use std::fmt::Display;

use super::{
    constants::{CR, LF, XON, ZBIN, ZBIN32, ZDLE, ZHEX, ZPAD},
    err::TransmissionError,
    from_hex, get_hex, read_byte, read_zdle_bytes, CanCounter, EncodeByteMap, TIMEOUT,
};
use crate::{com::Com, TransferResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Bin,
    Bin32,
    Hex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZFrameType {
    /// Request receive init (s->r)
    RQInit = 0,
    /// Receive init (r->s)
    RInit = 1,
    /// Send init sequence, optional (s->r)
    SInit = 2,
    /// ACK to RQInit, SInit, Challenge or a ZCRCQ/ZCRCW subpacket
    Ack = 3,
    /// File name and metadata from sender (s->r)
    File = 4,
    /// To sender: skip this file (r->s)
    Skip = 5,
    /// Last header was garbled
    Nak = 6,
    /// Abort batch transfers
    Abort = 7,
    /// Finish session (s<->r)
    Fin = 8,
    /// Resume data transmission at this position (r->s)
    RPos = 9,
    /// Data subpackets follow (s->r)
    Data = 10,
    /// End of file, data field holds the length (s->r)
    Eof = 11,
    /// Fatal read or write error detected
    FErr = 12,
    /// Request for file CRC and response
    Crc = 13,
    /// Receiver's challenge (r->s)
    Challenge = 14,
    /// Request is complete
    Compl = 15,
    /// Pseudo frame: other end cancelled with CAN*5
    Can = 16,
    /// Request for free bytes on the filesystem (s->r)
    FreeCnt = 17,
    /// Command from sending program (s->r)
    Command = 18,
    /// Output to standard error, data follows
    StdErr = 19,
}

impl ZFrameType {
    pub fn from_wire_byte(byte: u8) -> TransferResult<Self> {
        match byte {
            0 => Ok(ZFrameType::RQInit),
            1 => Ok(ZFrameType::RInit),
            2 => Ok(ZFrameType::SInit),
            3 => Ok(ZFrameType::Ack),
            4 => Ok(ZFrameType::File),
            5 => Ok(ZFrameType::Skip),
            6 => Ok(ZFrameType::Nak),
            7 => Ok(ZFrameType::Abort),
            8 => Ok(ZFrameType::Fin),
            9 => Ok(ZFrameType::RPos),
            10 => Ok(ZFrameType::Data),
            11 => Ok(ZFrameType::Eof),
            12 => Ok(ZFrameType::FErr),
            13 => Ok(ZFrameType::Crc),
            14 => Ok(ZFrameType::Challenge),
            15 => Ok(ZFrameType::Compl),
            16 => Ok(ZFrameType::Can),
            17 => Ok(ZFrameType::FreeCnt),
            18 => Ok(ZFrameType::Command),
            19 => Ok(ZFrameType::StdErr),
            _ => Err(TransmissionError::InvalidFrameType(byte).into()),
        }
    }

    /// True if this type carries its number low byte first on the wire.
    ///
    /// These are the types rzsz serializes through its position header
    /// routine. ZACK and ZCHALLENGE values end up low byte first on the
    /// wire too - the original implementations reach the same bytes by
    /// flipping the value before encoding it "big endian".
    fn number_is_little_endian(self) -> bool {
        matches!(
            self,
            ZFrameType::RPos
                | ZFrameType::Eof
                | ZFrameType::Crc
                | ZFrameType::Compl
                | ZFrameType::FreeCnt
                | ZFrameType::SInit
                | ZFrameType::Data
                | ZFrameType::Ack
                | ZFrameType::Challenge
        )
    }
}

/// A five byte Zmodem header: one type byte plus four data bytes, either
/// four flags (ZF3..ZF0) or a 32 bit number.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub header_type: HeaderType,
    pub frame_type: ZFrameType,
    pub data: [u8; 4],
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.frame_type {
            ZFrameType::RPos | ZFrameType::Eof | ZFrameType::FreeCnt | ZFrameType::Data | ZFrameType::Ack => {
                write!(f, "[{:?} header, number = {}]", self.frame_type, self.number())
            }
            ZFrameType::Crc | ZFrameType::Challenge => {
                write!(f, "[{:?} header, number = x{:08X}]", self.frame_type, self.number())
            }
            _ => write!(
                f,
                "[{:?} header, flags = x{:02X}, x{:02X}, x{:02X}, x{:02X}]",
                self.frame_type,
                self.f3(),
                self.f2(),
                self.f1(),
                self.f0()
            ),
        }
    }
}

impl Header {
    pub fn empty(header_type: HeaderType, frame_type: ZFrameType) -> Self {
        Self {
            header_type,
            frame_type,
            data: [0, 0, 0, 0],
        }
    }

    pub fn from_flags(
        header_type: HeaderType,
        frame_type: ZFrameType,
        f3: u8,
        f2: u8,
        f1: u8,
        f0: u8,
    ) -> Self {
        Self {
            header_type,
            frame_type,
            data: [f3, f2, f1, f0],
        }
    }

    pub fn from_number(header_type: HeaderType, frame_type: ZFrameType, number: u32) -> Self {
        let data = if frame_type.number_is_little_endian() {
            number.to_le_bytes()
        } else {
            number.to_be_bytes()
        };
        Self {
            header_type,
            frame_type,
            data,
        }
    }

    pub fn f0(&self) -> u8 {
        self.data[3]
    }
    pub fn f1(&self) -> u8 {
        self.data[2]
    }
    pub fn f2(&self) -> u8 {
        self.data[1]
    }
    pub fn f3(&self) -> u8 {
        self.data[0]
    }
    pub fn p0(&self) -> u8 {
        self.data[0]
    }
    pub fn p1(&self) -> u8 {
        self.data[1]
    }

    pub fn number(&self) -> u32 {
        if self.frame_type.number_is_little_endian() {
            u32::from_le_bytes(self.data)
        } else {
            u32::from_be_bytes(self.data)
        }
    }

    pub fn build(&self, map: &EncodeByteMap) -> Vec<u8> {
        let mut res = Vec::new();
        let wire = [
            self.frame_type as u8,
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ];

        match self.header_type {
            HeaderType::Bin => {
                res.extend_from_slice(&[ZPAD, ZDLE, ZBIN]);
                map.encode_into(&mut res, &wire);
                let crc16 = crate::crc::get_crc16(&wire);
                map.encode_into(&mut res, &crc16.to_be_bytes());
            }

            HeaderType::Bin32 => {
                res.extend_from_slice(&[ZPAD, ZDLE, ZBIN32]);
                map.encode_into(&mut res, &wire);
                let crc32 = crate::crc::get_crc32(&wire);
                map.encode_into(&mut res, &crc32.to_le_bytes());
            }

            HeaderType::Hex => {
                res.extend_from_slice(&[ZPAD, ZPAD, ZDLE, ZHEX]);
                for b in wire {
                    res.push(get_hex((b >> 4) & 0xF));
                    res.push(get_hex(b & 0xF));
                }
                let crc16 = crate::crc::get_crc16(&wire);
                for b in crc16.to_be_bytes() {
                    res.push(get_hex((b >> 4) & 0xF));
                    res.push(get_hex(b & 0xF));
                }
                res.push(CR);
                // rzsz flips the high bit of the LF here.
                res.push(LF | 0x80);
                match self.frame_type {
                    ZFrameType::Ack | ZFrameType::Fin => {}
                    _ => res.push(XON),
                }
            }
        }
        res
    }

    pub fn write(&self, com: &mut Box<dyn Com>, map: &EncodeByteMap) -> TransferResult<usize> {
        let data = self.build(map);
        com.write(&data)?;
        Ok(data.len())
    }

    /// Read and decode the next header off the wire.
    ///
    /// Anything that is not the start of a well formed header is skipped as
    /// line noise: the "rz\r" invitation, the "OO" trailer, and - after an
    /// error rewind - kilobytes of stale data subpackets the sender pushed
    /// before it saw our ZRPOS. Every skipped byte still runs through the
    /// Ctrl-X counter so an abort sequence hidden in the garbage is seen.
    pub fn read(com: &mut Box<dyn Com>, can: &mut CanCounter) -> TransferResult<Header> {
        let mut skipped = 0;
        let mut skip = |count: &mut usize, ch: u8| -> TransferResult<()> {
            *count += 1;
            if *count > 16384 {
                Err(TransmissionError::ZPADExpected(ch).into())
            } else {
                Ok(())
            }
        };
        let encoding = loop {
            let mut ch = read_byte(com, TIMEOUT, can)?;
            while ch != ZPAD {
                skip(&mut skipped, ch)?;
                ch = read_byte(com, TIMEOUT, can)?;
            }
            while ch == ZPAD {
                ch = read_byte(com, TIMEOUT, can)?;
            }
            if ch != ZDLE {
                skip(&mut skipped, ch)?;
                continue;
            }
            let encoding = read_byte(com, TIMEOUT, can)?;
            match encoding {
                ZBIN | ZBIN32 | ZHEX => break encoding,
                _ => {
                    skip(&mut skipped, encoding)?;
                    continue;
                }
            }
        };

        match encoding {
            ZBIN => {
                let bytes = read_zdle_bytes(com, 7, can)?;
                let crc16 = crate::crc::get_crc16(&bytes[0..5]);
                let check_crc16 = u16::from_be_bytes(bytes[5..7].try_into().unwrap());
                if crc16 != check_crc16 {
                    return Err(TransmissionError::CRC16Mismatch(check_crc16, crc16).into());
                }
                Ok(Header {
                    header_type: HeaderType::Bin,
                    frame_type: ZFrameType::from_wire_byte(bytes[0])?,
                    data: bytes[1..5].try_into().unwrap(),
                })
            }
            ZBIN32 => {
                let bytes = read_zdle_bytes(com, 9, can)?;
                let crc32 = crate::crc::get_crc32(&bytes[0..5]);
                let check_crc32 = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
                if crc32 != check_crc32 {
                    return Err(TransmissionError::CRC32Mismatch(check_crc32, crc32).into());
                }
                Ok(Header {
                    header_type: HeaderType::Bin32,
                    frame_type: ZFrameType::from_wire_byte(bytes[0])?,
                    data: bytes[1..5].try_into().unwrap(),
                })
            }
            ZHEX => {
                let mut bytes = [0u8; 7];
                for b in &mut bytes {
                    let hi = from_hex(read_byte(com, TIMEOUT, can)?)?;
                    let lo = from_hex(read_byte(com, TIMEOUT, can)?)?;
                    *b = (hi << 4) | lo;
                }
                let crc16 = crate::crc::get_crc16(&bytes[0..5]);
                let check_crc16 = u16::from_be_bytes(bytes[5..7].try_into().unwrap());
                if crc16 != check_crc16 {
                    return Err(TransmissionError::CRC16Mismatch(check_crc16, crc16).into());
                }

                // End of line; some implementations send CR + high bit LF,
                // some just an LF.
                let eol = read_byte(com, TIMEOUT, can)?;
                if eol == CR {
                    let _ = read_byte(com, TIMEOUT, can)?;
                }
                // Hex headers except ZACK and ZFIN carry a trailing XON.
                match bytes[0] {
                    3 | 8 => {}
                    _ => {
                        let _ = read_byte(com, TIMEOUT, can)?;
                    }
                }

                Ok(Header {
                    header_type: HeaderType::Hex,
                    frame_type: ZFrameType::from_wire_byte(bytes[0])?,
                    data: bytes[1..5].try_into().unwrap(),
                })
            }
            _ => unreachable!("scan loop only exits on a known encoding byte"),
        }
    }
}
