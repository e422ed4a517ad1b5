//! Attribute-policy registry.
//!
//! Built once at startup and read-only afterwards. Policies are keyed by
//! (resource type, attribute short-name); flexContainer specializations
//! are additionally keyed by their `cnd` value.

use std::collections::HashMap;

use crate::resource::ResourceType;

use super::policy::{
    AnnouncePolicy::{self, *},
    AttributePolicy,
    AttributeType::{self, *},
    Cardinality,
    RequestOptionality::{self, *},
};

fn single(
    data_type: AttributeType,
    create: RequestOptionality,
    update: RequestOptionality,
    announce: AnnouncePolicy,
) -> AttributePolicy {
    AttributePolicy::new(data_type, Cardinality::Single, create, update, announce)
}

fn multi(
    data_type: AttributeType,
    create: RequestOptionality,
    update: RequestOptionality,
    announce: AnnouncePolicy,
) -> AttributePolicy {
    AttributePolicy::new(data_type, Cardinality::Multiple, create, update, announce)
}

type AttributeTable = HashMap<&'static str, AttributePolicy>;

/// Universal attributes shared by every resource type.
fn universal_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("ri", single(String, NotPresent, NotPresent, NotAnnounced)),
        ("rn", single(String, Optional, NotPresent, NotAnnounced)),
        ("pi", single(String, NotPresent, NotPresent, NotAnnounced)),
        ("ty", single(Integer, NotPresent, NotPresent, NotAnnounced)),
        ("ct", single(Timestamp, NotPresent, NotPresent, NotAnnounced)),
        ("lt", single(Timestamp, NotPresent, NotPresent, NotAnnounced)),
        ("et", single(Timestamp, Optional, Optional, MandatoryAnnounced)),
        ("lbl", multi(ListOfStrings, Optional, Optional, OptionalAnnounced)),
        ("acpi", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        ("at", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        ("aa", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
    ]
}

fn cse_base_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("cst", single(Integer, NotPresent, NotPresent, NotAnnounced)),
        ("csi", single(String, NotPresent, NotPresent, NotAnnounced)),
        ("srt", multi(List, NotPresent, NotPresent, NotAnnounced)),
        ("poa", multi(ListOfStrings, NotPresent, NotPresent, NotAnnounced)),
    ]
}

fn ae_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("api", single(String, Mandatory, NotPresent, OptionalAnnounced)),
        ("aei", single(String, NotPresent, NotPresent, OptionalAnnounced)),
        ("apn", single(String, Optional, Optional, OptionalAnnounced)),
        ("poa", multi(ListOfStrings, Optional, Optional, OptionalAnnounced)),
        ("rr", single(Bool, Optional, Optional, NotAnnounced)),
        ("srv", multi(ListOfStrings, Optional, Optional, OptionalAnnounced)),
        ("nl", single(String, Optional, Optional, OptionalAnnounced)),
        ("or", single(String, Optional, Optional, OptionalAnnounced)),
        ("csz", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
    ]
}

fn cnt_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("mni", single(NonNegInteger, Optional, Optional, OptionalAnnounced)),
        ("mbs", single(NonNegInteger, Optional, Optional, OptionalAnnounced)),
        ("mia", single(NonNegInteger, Optional, Optional, OptionalAnnounced)),
        ("cni", single(NonNegInteger, NotPresent, NotPresent, NotAnnounced)),
        ("cbs", single(NonNegInteger, NotPresent, NotPresent, NotAnnounced)),
        ("st", single(NonNegInteger, NotPresent, NotPresent, OptionalAnnounced)),
        ("li", single(String, Optional, Optional, OptionalAnnounced)),
        ("or", single(String, Optional, Optional, OptionalAnnounced)),
        ("disr", single(Bool, Optional, Optional, OptionalAnnounced)),
        ("cr", single(String, Optional, NotPresent, NotAnnounced)),
    ]
}

fn cin_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("cnf", single(String, Optional, NotPresent, OptionalAnnounced)),
        ("cs", single(NonNegInteger, NotPresent, NotPresent, OptionalAnnounced)),
        ("con", single(Any, Mandatory, NotPresent, OptionalAnnounced)),
        ("conr", multi(List, Optional, NotPresent, NotAnnounced)),
        ("or", single(String, Optional, NotPresent, OptionalAnnounced)),
        ("st", single(NonNegInteger, NotPresent, NotPresent, OptionalAnnounced)),
        ("cr", single(String, Optional, NotPresent, NotAnnounced)),
    ]
}

fn acp_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("pv", single(Complex, Mandatory, Optional, MandatoryAnnounced)),
        ("pvs", single(Complex, Mandatory, Optional, MandatoryAnnounced)),
    ]
}

fn sub_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("nu", multi(ListOfStrings, Mandatory, Optional, NotAnnounced)),
        ("enc", single(Complex, Optional, Optional, NotAnnounced)),
        ("bn", single(Complex, Optional, Optional, NotAnnounced)),
        ("nct", single(Integer, Optional, Optional, NotAnnounced)),
        ("exc", single(PositiveInteger, Optional, Optional, NotAnnounced)),
        ("ln", single(Bool, Optional, Optional, NotAnnounced)),
        ("acrs", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        ("su", single(String, Optional, NotPresent, NotAnnounced)),
        ("cr", single(String, Optional, NotPresent, NotAnnounced)),
    ]
}

fn grp_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("mt", single(Integer, Mandatory, NotPresent, OptionalAnnounced)),
        ("mnm", single(PositiveInteger, Mandatory, Optional, NotAnnounced)),
        ("mid", multi(ListOfStrings, Mandatory, Optional, OptionalAnnounced)),
        ("cnm", single(NonNegInteger, NotPresent, NotPresent, NotAnnounced)),
        ("csy", single(Integer, Optional, NotPresent, NotAnnounced)),
        ("macp", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        ("mtv", single(Bool, NotPresent, NotPresent, NotAnnounced)),
        ("gn", single(String, Optional, Optional, NotAnnounced)),
        ("cr", single(String, Optional, NotPresent, NotAnnounced)),
    ]
}

fn nod_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("ni", single(String, Mandatory, Optional, OptionalAnnounced)),
        ("nid", single(String, NotPresent, NotPresent, OptionalAnnounced)),
        ("hcl", single(String, Optional, Optional, NotAnnounced)),
    ]
}

fn csr_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("cst", single(Integer, Optional, NotPresent, NotAnnounced)),
        ("poa", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        ("cb", single(String, Mandatory, NotPresent, NotAnnounced)),
        ("csi", single(String, Mandatory, NotPresent, NotAnnounced)),
        ("rr", single(Bool, Optional, Optional, NotAnnounced)),
        ("nl", single(String, Optional, Optional, NotAnnounced)),
    ]
}

fn mgmt_obj_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("mgd", single(Integer, Mandatory, NotPresent, MandatoryAnnounced)),
        ("obis", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        ("obps", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        ("dc", single(String, Optional, Optional, OptionalAnnounced)),
        ("cmlk", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        // dataCollection specialization
        ("cntp", single(String, Optional, Optional, NotAnnounced)),
        ("rpsc", single(PositiveInteger, Optional, Optional, NotAnnounced)),
        ("rpil", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
        ("mesc", single(PositiveInteger, Optional, Optional, NotAnnounced)),
        ("meil", multi(ListOfStrings, Optional, Optional, NotAnnounced)),
    ]
}

fn flex_container_attributes() -> Vec<(&'static str, AttributePolicy)> {
    vec![
        ("cnd", single(String, Mandatory, NotPresent, MandatoryAnnounced)),
        ("cs", single(NonNegInteger, NotPresent, NotPresent, NotAnnounced)),
        ("or", single(String, Optional, Optional, OptionalAnnounced)),
        ("cr", single(String, Optional, NotPresent, NotAnnounced)),
    ]
}

/// Registry of attribute policies, plus flexContainer specializations
/// keyed by `cnd`.
#[derive(Debug)]
pub struct PolicyRegistry {
    policies: HashMap<ResourceType, AttributeTable>,
    flex_specializations: HashMap<std::string::String, AttributeTable>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        let mut policies: HashMap<ResourceType, AttributeTable> = HashMap::new();

        let type_tables: Vec<(ResourceType, Vec<(&'static str, AttributePolicy)>)> = vec![
            (ResourceType::CseBase, cse_base_attributes()),
            (ResourceType::Ae, ae_attributes()),
            (ResourceType::Cnt, cnt_attributes()),
            (ResourceType::Cin, cin_attributes()),
            (ResourceType::Acp, acp_attributes()),
            (ResourceType::Sub, sub_attributes()),
            (ResourceType::Grp, grp_attributes()),
            (ResourceType::Nod, nod_attributes()),
            (ResourceType::Csr, csr_attributes()),
            (ResourceType::MgmtObj, mgmt_obj_attributes()),
            (ResourceType::FlexContainer, flex_container_attributes()),
        ];

        for (ty, specific) in type_tables {
            let mut table: AttributeTable = universal_attributes().into_iter().collect();
            table.extend(specific);
            policies.insert(ty, table);
        }

        // Announced variants: everything announceable from the base is
        // accepted from the announcing CSE, plus the link attributes.
        let announced: Vec<ResourceType> = policies
            .keys()
            .filter_map(|ty| ty.announced())
            .collect();
        for annc_ty in announced {
            let base = annc_ty.announced_source().expect("announced variant");
            let mut table: AttributeTable = universal_attributes().into_iter().collect();
            for (name, policy) in policies.get(&base).expect("base table") {
                if policy.is_announceable() {
                    table.insert(
                        *name,
                        AttributePolicy::new(
                            policy.data_type,
                            policy.cardinality,
                            Optional,
                            Optional,
                            NotAnnounced,
                        ),
                    );
                }
            }
            table.insert("lnk", single(String, Mandatory, NotPresent, NotAnnounced));
            table.insert("ast", single(Integer, Optional, Optional, NotAnnounced));
            policies.insert(annc_ty, table);
        }

        Self {
            policies,
            flex_specializations: HashMap::new(),
        }
    }

    /// Register a flexContainer specialization: custom attribute policies
    /// applied in addition to the flexContainer base attributes for
    /// resources with this `cnd`.
    pub fn register_flex_specialization(
        &mut self,
        cnd: impl Into<std::string::String>,
        attributes: Vec<(&'static str, AttributePolicy)>,
    ) {
        self.flex_specializations
            .insert(cnd.into(), attributes.into_iter().collect());
    }

    pub fn attributes_of(&self, ty: ResourceType) -> Option<&AttributeTable> {
        self.policies.get(&ty)
    }

    /// Look up the policy for an attribute, considering the flex
    /// specialization table when a `cnd` is given.
    pub fn policy(
        &self,
        ty: ResourceType,
        cnd: Option<&str>,
        attribute: &str,
    ) -> Option<&AttributePolicy> {
        if let Some(policy) = self.policies.get(&ty).and_then(|t| t.get(attribute)) {
            return Some(policy);
        }
        cnd.and_then(|c| self.flex_specializations.get(c))
            .and_then(|t| t.get(attribute))
    }

    /// Announced attribute names of a type, split into mandatory and
    /// optional classes.
    pub fn announced_attributes(&self, ty: ResourceType) -> (Vec<&'static str>, Vec<&'static str>) {
        let mut mandatory = Vec::new();
        let mut optional = Vec::new();
        if let Some(table) = self.policies.get(&ty) {
            for (name, policy) in table {
                match policy.announce {
                    MandatoryAnnounced => mandatory.push(*name),
                    OptionalAnnounced => optional.push(*name),
                    NotAnnounced => {}
                }
            }
        }
        mandatory.sort_unstable();
        optional.sort_unstable();
        (mandatory, optional)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universal_attributes_present_for_every_type() {
        let registry = PolicyRegistry::new();
        for ty in [ResourceType::Ae, ResourceType::Cin, ResourceType::Sub] {
            let table = registry.attributes_of(ty).unwrap();
            assert!(table.contains_key("ri"));
            assert!(table.contains_key("et"));
            assert!(table.contains_key("lbl"));
        }
    }

    #[test]
    fn announced_table_contains_link() {
        let registry = PolicyRegistry::new();
        let table = registry.attributes_of(ResourceType::AeAnnc).unwrap();
        assert_eq!(table.get("lnk").unwrap().create, Mandatory);
        // non-announceable base attribute does not leak into the variant
        assert!(!table.contains_key("csz"));
        // announceable one does
        assert!(table.contains_key("api"));
    }

    #[test]
    fn flex_specialization_lookup() {
        let mut registry = PolicyRegistry::new();
        registry.register_flex_specialization(
            "org.example.color",
            vec![(
                "rgb",
                AttributePolicy::new(
                    AttributeType::String,
                    Cardinality::Single,
                    Mandatory,
                    Optional,
                    NotAnnounced,
                ),
            )],
        );
        assert!(
            registry
                .policy(ResourceType::FlexContainer, Some("org.example.color"), "rgb")
                .is_some()
        );
        assert!(
            registry
                .policy(ResourceType::FlexContainer, None, "rgb")
                .is_none()
        );
    }
}
