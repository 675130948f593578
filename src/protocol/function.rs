use std::fmt;

use serde::{Deserialize, Serialize};

/// Declares `FunctionCode`, its wire values and the lookup table together
macro_rules! function_codes {
    ($($(#[$doc:meta])* $name:ident = $code:literal,)+) => {
        /// Function code carried in byte 4 of every addressed frame
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum FunctionCode {
            $($(#[$doc])* $name,)+
            /// Code not known to this gateway; logged and otherwise ignored
            Undefined(u8),
        }

        /// Known codes and their wire values
        const FUNCTION_TABLE: &[(FunctionCode, u8)] = &[$((FunctionCode::$name, $code),)+];

        impl FunctionCode {
            /// Wire value of this function
            pub fn code(&self) -> u8 {
                match self {
                    $(FunctionCode::$name => $code,)+
                    FunctionCode::Undefined(code) => *code,
                }
            }
        }
    };
}

function_codes! {
    IncludeReq = 0x00,
    SIncludeReq = 0x01,
    IncludeGrant = 0x02,
    Reinclude = 0x04,
    Config = 0x05,
    SendBattery = 0x06,
    WokenUp = 0x07,
    Ack = 0x08,
    Alert = 0x09,
    Beacon = 0x0A,
    Start = 0x0B,
    Nack = 0x0C,
    IncludeNot = 0x0D,
    Configuring = 0x0E,
    Reset = 0xFF,
}

/// Reverse lookup indexed by wire value
static CODE_LOOKUP: [Option<FunctionCode>; 256] = build_lookup();

const fn build_lookup() -> [Option<FunctionCode>; 256] {
    let mut lookup = [None; 256];
    let mut i = 0;
    while i < FUNCTION_TABLE.len() {
        let (function, code) = FUNCTION_TABLE[i];
        lookup[code as usize] = Some(function);
        i += 1;
    }
    lookup
}

impl FunctionCode {
    /// Maps a wire value to its function; unknown values become `Undefined`
    pub fn from_code(code: u8) -> Self {
        CODE_LOOKUP[code as usize].unwrap_or(FunctionCode::Undefined(code))
    }

    /// The variant a receiver decodes for this function's wire value.
    /// `Undefined` wrapping a known code becomes that code's variant.
    pub fn canonical(self) -> Self {
        FunctionCode::from_code(self.code())
    }

    /// Sent exactly once and never waits for an acknowledgment
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, FunctionCode::Ack | FunctionCode::IncludeNot)
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionCode::Undefined(code) => write!(f, "undefined({:#04x})", code),
            other => write!(f, "{:?}", other),
        }
    }
}
