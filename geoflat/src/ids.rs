//! Feature identifiers and the per-blob namespace table.

use ahash::AHashMap;

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

pub const NAMESPACE_OSM_NODE: &str = "openstreetmap.org/node";
pub const NAMESPACE_OSM_WAY: &str = "openstreetmap.org/way";
pub const NAMESPACE_OSM_RELATION: &str = "openstreetmap.org/relation";
pub const NAMESPACE_PRIVATE: &str = "diagonal.works/ns/private";

/// Number of bits used to encode a `FeatureType` in compact ids.
pub const FEATURE_TYPE_BITS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FeatureType {
    Point = 0,
    Path = 1,
    Area = 2,
    Relation = 3,
    Invalid = 4,
}

impl FeatureType {
    /// All valid feature types, in encoding order.
    pub const ALL: [FeatureType; 4] = [
        FeatureType::Point,
        FeatureType::Path,
        FeatureType::Area,
        FeatureType::Relation,
    ];

    pub fn from_u8(v: u8) -> FeatureType {
        match v {
            0 => FeatureType::Point,
            1 => FeatureType::Path,
            2 => FeatureType::Area,
            3 => FeatureType::Relation,
            _ => FeatureType::Invalid,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FeatureType::Point => "point",
            FeatureType::Path => "path",
            FeatureType::Area => "area",
            FeatureType::Relation => "relation",
            FeatureType::Invalid => "invalid",
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cheaply clonable namespace string, eg `openstreetmap.org/way`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Namespace(Arc<str>);

impl Namespace {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Namespace(Arc::from(s))
    }
}

impl From<String> for Namespace {
    fn from(s: String) -> Self {
        Namespace(Arc::from(s))
    }
}

impl Deref for Namespace {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Namespace {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully qualified feature id. Ordering is by type, namespace string, value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureId {
    pub feature_type: FeatureType,
    pub namespace: Namespace,
    pub value: u64,
}

impl FeatureId {
    pub fn new(feature_type: FeatureType, namespace: Namespace, value: u64) -> Self {
        Self {
            feature_type,
            namespace,
            value,
        }
    }

    pub fn osm_node(value: u64) -> Self {
        Self::new(FeatureType::Point, NAMESPACE_OSM_NODE.into(), value)
    }

    pub fn osm_way_path(value: u64) -> Self {
        Self::new(FeatureType::Path, NAMESPACE_OSM_WAY.into(), value)
    }

    pub fn osm_way_area(value: u64) -> Self {
        Self::new(FeatureType::Area, NAMESPACE_OSM_WAY.into(), value)
    }

    pub fn osm_relation_area(value: u64) -> Self {
        Self::new(FeatureType::Area, NAMESPACE_OSM_RELATION.into(), value)
    }

    pub fn osm_relation(value: u64) -> Self {
        Self::new(FeatureType::Relation, NAMESPACE_OSM_RELATION.into(), value)
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.feature_type, self.namespace, self.value)
    }
}

/// Orders ids by type, then namespace string, then value.
pub fn compare(a: &FeatureId, b: &FeatureId) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Small integer standing in for a namespace within one blob.
pub type NamespaceCode = u16;

pub const NAMESPACE_INVALID: NamespaceCode = 0;

const NAMESPACE_BITS: u16 = 13;
const NAMESPACE_MASK: u16 = (1 << NAMESPACE_BITS) - 1;

/// Maximum number of namespaces one blob can address.
pub const MAX_NAMESPACES: usize = 1 << NAMESPACE_BITS;

/// Feature type and namespace code packed into 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeAndNamespace(pub u16);

impl TypeAndNamespace {
    pub const INVALID: TypeAndNamespace =
        TypeAndNamespace((FeatureType::Invalid as u16) << NAMESPACE_BITS);

    #[inline]
    pub fn new(feature_type: FeatureType, namespace: NamespaceCode) -> Self {
        debug_assert!(namespace <= NAMESPACE_MASK);
        TypeAndNamespace(((feature_type as u16) << NAMESPACE_BITS) | namespace)
    }

    #[inline]
    pub fn feature_type(self) -> FeatureType {
        FeatureType::from_u8((self.0 >> NAMESPACE_BITS) as u8)
    }

    #[inline]
    pub fn namespace(self) -> NamespaceCode {
        self.0 & NAMESPACE_MASK
    }
}

/// Bidirectional mapping between namespace strings and codes.
///
/// Codes are assigned in string order, so comparing codes compares the
/// underlying namespaces. Code 0 is always the empty (invalid) namespace.
#[derive(Debug, Clone, Default)]
pub struct NamespaceTable {
    namespaces: Vec<Namespace>,
    codes: AHashMap<Namespace, NamespaceCode>,
}

impl NamespaceTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replaces the table contents with `names`, plus the empty namespace.
    pub fn fill_from_namespaces<I>(&mut self, names: I)
    where
        I: IntoIterator<Item = Namespace>,
    {
        let mut namespaces: Vec<Namespace> = names.into_iter().collect();
        namespaces.push(Namespace::default());
        namespaces.sort();
        namespaces.dedup();
        assert!(
            namespaces.len() <= MAX_NAMESPACES,
            "too many namespaces: {}",
            namespaces.len()
        );
        self.codes = namespaces
            .iter()
            .enumerate()
            .map(|(code, ns)| (ns.clone(), code as NamespaceCode))
            .collect();
        self.namespaces = namespaces;
    }

    /// Rebuilds a table from its serialized list of strings.
    ///
    /// Returns `None` if the list is not a valid table, ie not sorted,
    /// not unique, or not starting with the empty namespace.
    pub fn from_strings(names: Vec<String>) -> Option<Self> {
        if names.first().map(String::as_str) != Some("") || names.len() > MAX_NAMESPACES {
            return None;
        }
        if names.windows(2).any(|w| w[0] >= w[1]) {
            return None;
        }
        let mut table = NamespaceTable::new();
        table.fill_from_namespaces(names.into_iter().map(Namespace::from));
        Some(table)
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.namespaces.iter().map(|ns| ns.to_string()).collect()
    }

    /// Returns the code of `ns`.
    ///
    /// Panics if `ns` was not registered, all namespaces must be known
    /// before encoding starts.
    pub fn encode(&self, ns: &str) -> NamespaceCode {
        match self.codes.get(ns) {
            Some(&code) => code,
            None => panic!("namespace {:?} not registered", ns),
        }
    }

    pub fn maybe_encode(&self, ns: &str) -> Option<NamespaceCode> {
        self.codes.get(ns).copied()
    }

    /// Returns the namespace for a code produced by this table.
    pub fn decode(&self, code: NamespaceCode) -> &Namespace {
        &self.namespaces[code as usize]
    }

    pub fn try_decode(&self, code: NamespaceCode) -> Option<&Namespace> {
        self.namespaces.get(code as usize)
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NamespaceCode, &Namespace)> {
        self.namespaces
            .iter()
            .enumerate()
            .map(|(code, ns)| (code as NamespaceCode, ns))
    }

    pub fn encode_type_and_namespace(&self, feature_type: FeatureType, ns: &str) -> TypeAndNamespace {
        TypeAndNamespace::new(feature_type, self.encode(ns))
    }

    pub fn decode_type_and_namespace(&self, tn: TypeAndNamespace) -> Option<(FeatureType, &Namespace)> {
        let feature_type = tn.feature_type();
        if feature_type == FeatureType::Invalid {
            return None;
        }
        self.try_decode(tn.namespace()).map(|ns| (feature_type, ns))
    }
}

/// The namespace that dominates references to each feature type.
///
/// References into a primary namespace are stored as small deltas without an
/// explicit namespace. Defaults to OpenStreetMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryNamespaces {
    pub point: Namespace,
    pub path: Namespace,
    pub area: Namespace,
    pub relation: Namespace,
}

impl Default for PrimaryNamespaces {
    fn default() -> Self {
        Self {
            point: NAMESPACE_OSM_NODE.into(),
            path: NAMESPACE_OSM_WAY.into(),
            area: NAMESPACE_OSM_WAY.into(),
            relation: NAMESPACE_OSM_RELATION.into(),
        }
    }
}

impl PrimaryNamespaces {
    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        [&self.point, &self.path, &self.area, &self.relation].into_iter()
    }

    pub fn encode(&self, table: &NamespaceTable) -> Namespaces {
        Namespaces([
            table.encode(&self.point),
            table.encode(&self.path),
            table.encode(&self.area),
            table.encode(&self.relation),
        ])
    }
}

/// Primary namespace codes indexed by feature type, as stored in each
/// feature block header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Namespaces(pub [NamespaceCode; 4]);

impl Namespaces {
    pub fn code(&self, feature_type: FeatureType) -> NamespaceCode {
        match feature_type {
            FeatureType::Invalid => NAMESPACE_INVALID,
            t => self.0[t as usize],
        }
    }

    /// The reference context used when encoding references to `feature_type`.
    pub fn primary(&self, feature_type: FeatureType) -> TypeAndNamespace {
        match feature_type {
            FeatureType::Invalid => TypeAndNamespace::INVALID,
            t => TypeAndNamespace::new(t, self.0[t as usize]),
        }
    }

    /// The namespaces of a block holding `feature_type` features of `code`:
    /// the slot of the block's own type names the block's namespace.
    pub fn for_block(mut self, feature_type: FeatureType, code: NamespaceCode) -> Self {
        if feature_type != FeatureType::Invalid {
            self.0[feature_type as usize] = code;
        }
        self
    }
}
