//! Resource type vocabulary.
//!
//! Every resource in the tree carries an integer type code (`ty`) and a
//! type-prefixed name (`tpe`, e.g. `m2m:cnt`) used as the outer key of
//! its wire representation. Announced variants live at the base code
//! plus an offset of 10000.

use serde::{Deserialize, Serialize};

const ANNOUNCED_OFFSET: i32 = 10_000;

/// Short names that address a virtual child rather than a stored
/// resource. They are stripped during address resolution and handled by
/// the dispatcher.
pub const VIRTUAL_NAMES: &[&str] = &["la", "ol", "fopt", "pcu"];

/// Resource type codes handled by this CSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ResourceType {
    Acp,
    Ae,
    Cnt,
    Cin,
    CseBase,
    Grp,
    MgmtObj,
    Nod,
    Csr,
    Sub,
    FlexContainer,
    AcpAnnc,
    AeAnnc,
    CntAnnc,
    CinAnnc,
    GrpAnnc,
    MgmtObjAnnc,
    NodAnnc,
    FlexContainerAnnc,
}

impl ResourceType {
    pub fn code(&self) -> i32 {
        use ResourceType::*;
        match self {
            Acp => 1,
            Ae => 2,
            Cnt => 3,
            Cin => 4,
            CseBase => 5,
            Grp => 9,
            MgmtObj => 13,
            Nod => 14,
            Csr => 16,
            Sub => 23,
            FlexContainer => 28,
            AcpAnnc => 1 + ANNOUNCED_OFFSET,
            AeAnnc => 2 + ANNOUNCED_OFFSET,
            CntAnnc => 3 + ANNOUNCED_OFFSET,
            CinAnnc => 4 + ANNOUNCED_OFFSET,
            GrpAnnc => 9 + ANNOUNCED_OFFSET,
            MgmtObjAnnc => 13 + ANNOUNCED_OFFSET,
            NodAnnc => 14 + ANNOUNCED_OFFSET,
            FlexContainerAnnc => 28 + ANNOUNCED_OFFSET,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use ResourceType::*;
        let ty = match code {
            1 => Acp,
            2 => Ae,
            3 => Cnt,
            4 => Cin,
            5 => CseBase,
            9 => Grp,
            13 => MgmtObj,
            14 => Nod,
            16 => Csr,
            23 => Sub,
            28 => FlexContainer,
            10_001 => AcpAnnc,
            10_002 => AeAnnc,
            10_003 => CntAnnc,
            10_004 => CinAnnc,
            10_009 => GrpAnnc,
            10_013 => MgmtObjAnnc,
            10_014 => NodAnnc,
            10_028 => FlexContainerAnnc,
            _ => return None,
        };
        Some(ty)
    }

    /// The default type-prefixed outer key for this type.
    ///
    /// FlexContainer specializations and mgmtObj specializations carry
    /// their own prefixes; those are resolved by the factory from the
    /// payload, with this value as the generic fallback.
    pub fn type_prefix(&self) -> &'static str {
        use ResourceType::*;
        match self {
            Acp => "m2m:acp",
            Ae => "m2m:ae",
            Cnt => "m2m:cnt",
            Cin => "m2m:cin",
            CseBase => "m2m:cb",
            Grp => "m2m:grp",
            MgmtObj => "m2m:mgo",
            Nod => "m2m:nod",
            Csr => "m2m:csr",
            Sub => "m2m:sub",
            FlexContainer => "m2m:fcnt",
            AcpAnnc => "m2m:acpA",
            AeAnnc => "m2m:aeA",
            CntAnnc => "m2m:cntA",
            CinAnnc => "m2m:cinA",
            GrpAnnc => "m2m:grpA",
            MgmtObjAnnc => "m2m:mgoA",
            NodAnnc => "m2m:nodA",
            FlexContainerAnnc => "m2m:fcntA",
        }
    }

    /// Resolve a type-prefixed outer key to a resource type.
    pub fn from_type_prefix(tpe: &str) -> Option<Self> {
        use ResourceType::*;
        let ty = match tpe {
            "m2m:acp" => Acp,
            "m2m:ae" => Ae,
            "m2m:cnt" => Cnt,
            "m2m:cin" => Cin,
            "m2m:cb" => CseBase,
            "m2m:grp" => Grp,
            "m2m:mgo" | "m2m:datc" => MgmtObj,
            "m2m:nod" => Nod,
            "m2m:csr" => Csr,
            "m2m:sub" => Sub,
            "m2m:fcnt" => FlexContainer,
            "m2m:acpA" => AcpAnnc,
            "m2m:aeA" => AeAnnc,
            "m2m:cntA" => CntAnnc,
            "m2m:cinA" => CinAnnc,
            "m2m:grpA" => GrpAnnc,
            "m2m:mgoA" | "m2m:datcA" => MgmtObjAnnc,
            "m2m:nodA" => NodAnnc,
            "m2m:fcntA" => FlexContainerAnnc,
            _ => return None,
        };
        Some(ty)
    }

    /// The announced variant of this type, if it is announceable.
    pub fn announced(&self) -> Option<Self> {
        Self::from_code(self.code() + ANNOUNCED_OFFSET)
    }

    pub fn is_announced_variant(&self) -> bool {
        self.code() > ANNOUNCED_OFFSET
    }

    /// The base type of an announced variant.
    pub fn announced_source(&self) -> Option<Self> {
        if self.is_announced_variant() {
            Self::from_code(self.code() - ANNOUNCED_OFFSET)
        } else {
            None
        }
    }

    /// Child resource types a parent of this type accepts.
    pub fn allowed_children(&self) -> &'static [ResourceType] {
        use ResourceType::*;
        match self {
            CseBase => &[Acp, Ae, Cnt, FlexContainer, Grp, Nod, Csr, Sub],
            Ae => &[Acp, Cnt, FlexContainer, Grp, Sub],
            Cnt => &[Cnt, Cin, Sub],
            Acp => &[Sub],
            Grp => &[Sub],
            Nod => &[MgmtObj, Sub],
            MgmtObj => &[Sub],
            FlexContainer => &[Cnt, FlexContainer, Sub],
            Csr => &[
                Cnt,
                FlexContainer,
                Grp,
                Sub,
                AcpAnnc,
                AeAnnc,
                CntAnnc,
                CinAnnc,
                GrpAnnc,
                MgmtObjAnnc,
                NodAnnc,
                FlexContainerAnnc,
            ],
            AeAnnc => &[CntAnnc, AcpAnnc, GrpAnnc, FlexContainerAnnc],
            CntAnnc => &[CntAnnc, CinAnnc],
            NodAnnc => &[MgmtObjAnnc],
            Cin | Sub | AcpAnnc | CinAnnc | GrpAnnc | MgmtObjAnnc | FlexContainerAnnc => &[],
        }
    }

    /// Whether an empty `acpi` falls back to the parent's policies.
    pub fn inherits_acp(&self) -> bool {
        matches!(
            self,
            ResourceType::Cin | ResourceType::Acp | ResourceType::Sub
        )
    }

    /// Resources that never expire and cannot carry `et`.
    pub fn is_unexpirable(&self) -> bool {
        matches!(self, ResourceType::CseBase)
    }
}

impl TryFrom<i32> for ResourceType {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        ResourceType::from_code(code).ok_or_else(|| format!("unknown resource type {code}"))
    }
}

impl From<ResourceType> for i32 {
    fn from(ty: ResourceType) -> i32 {
        ty.code()
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_prefix())
    }
}

/// mgmtObj specializations (`mgd` attribute values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum MgmtDefinition {
    DataCollection,
}

impl MgmtDefinition {
    pub fn code(&self) -> i32 {
        match self {
            MgmtDefinition::DataCollection => 1021,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1021 => Some(MgmtDefinition::DataCollection),
            _ => None,
        }
    }

    pub fn type_prefix(&self) -> &'static str {
        match self {
            MgmtDefinition::DataCollection => "m2m:datc",
        }
    }
}

impl TryFrom<i32> for MgmtDefinition {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        MgmtDefinition::from_code(code).ok_or_else(|| format!("unknown mgmtDefinition {code}"))
    }
}

impl From<MgmtDefinition> for i32 {
    fn from(mgd: MgmtDefinition) -> i32 {
        mgd.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announced_offset_round_trip() {
        assert_eq!(ResourceType::Ae.announced(), Some(ResourceType::AeAnnc));
        assert_eq!(
            ResourceType::AeAnnc.announced_source(),
            Some(ResourceType::Ae)
        );
        assert_eq!(ResourceType::AeAnnc.code(), 10_002);
        assert!(ResourceType::AeAnnc.is_announced_variant());
        assert!(!ResourceType::Ae.is_announced_variant());
    }

    #[test]
    fn prefix_lookup() {
        assert_eq!(
            ResourceType::from_type_prefix("m2m:cnt"),
            Some(ResourceType::Cnt)
        );
        assert_eq!(
            ResourceType::from_type_prefix("m2m:datc"),
            Some(ResourceType::MgmtObj)
        );
        assert_eq!(ResourceType::from_type_prefix("m2m:nope"), None);
    }

    #[test]
    fn cin_accepts_no_children() {
        assert!(ResourceType::Cin.allowed_children().is_empty());
        assert!(
            ResourceType::Cnt
                .allowed_children()
                .contains(&ResourceType::Cin)
        );
    }
}
