use std::fmt;

use serde::{Deserialize, Serialize};

/// Congenital heart disease categories, in the index order of the
/// classifier head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChdClass {
    #[serde(rename = "ASD")]
    Asd,
    #[serde(rename = "Normal")]
    Normal,
    #[serde(rename = "PDA")]
    Pda,
    #[serde(rename = "VSD")]
    Vsd,
}

pub const NUM_CLASSES: usize = 4;

impl ChdClass {
    pub const ALL: [ChdClass; NUM_CLASSES] = [Self::Asd, Self::Normal, Self::Pda, Self::Vsd];

    pub fn index(self) -> usize {
        match self {
            Self::Asd => 0,
            Self::Normal => 1,
            Self::Pda => 2,
            Self::Vsd => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asd => "ASD",
            Self::Normal => "Normal",
            Self::Pda => "PDA",
            Self::Vsd => "VSD",
        }
    }
}

impl fmt::Display for ChdClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
