//! OpenStreetMap elements and their conversion into features.
//!
//! Nodes become points and ways become paths. Closed ways whose tags describe
//! an area additionally become areas, and so do multipolygon relations made
//! of such ways. All other relations become relations.

use crate::error::{Error, Result};
use crate::ids::FeatureId;
use crate::source::{
    current_worker, AreaFeature, Emit, Feature, FeatureSource, PathFeature, PointFeature,
    ReadOptions, RelationFeature, SourceMember, SourcePolygon, SourceTag, SourceVertex,
};
use crate::values::LatLng;

use ahash::{AHashMap, AHashSet};
use log::debug;
use rayon::prelude::*;

/// Keys searchable by `key=value`.
pub const SEARCHABLE_KEYS: &[&str] = &[
    "amenity", "barrier", "boundary", "bridge", "building", "highway", "landuse", "leisure",
    "natural", "network", "place", "railway", "route", "shop", "tourism", "water", "waterway",
];

/// Keys searchable by presence.
pub const IDENTIFIER_KEYS: &[&str] = &["fhrs:id", "wikidata", "wikipedia"];

/// Keys that make a closed way an area.
const AREA_KEYS: &[&str] = &["amenity", "building", "landuse", "leisure", "natural"];

/// Key of a stored tag for an OSM tag key.
pub fn key_for_osm_key(key: &str) -> String {
    if SEARCHABLE_KEYS.contains(&key) {
        format!("#{}", key)
    } else if IDENTIFIER_KEYS.contains(&key) {
        format!("@{}", key)
    } else {
        key.to_string()
    }
}

pub fn tags_from_osm(tags: &[SourceTag]) -> Vec<SourceTag> {
    tags.iter()
        .map(|tag| SourceTag::new(key_for_osm_key(&tag.key), tag.value.clone()))
        .collect()
}

fn tag<'a>(tags: &'a [SourceTag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.key == key)
        .map(|t| t.value.as_str())
}

/// Whether a closed way with `tags` describes an area rather than a line.
pub fn implies_area(tags: &[SourceTag]) -> bool {
    match tag(tags, "area") {
        Some("yes") => true,
        Some("no") => false,
        _ => {
            if tag(tags, "highway").is_some() || tag(tags, "barrier").is_some() {
                return false;
            }
            tags.iter().any(|t| AREA_KEYS.contains(&t.key.as_str()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsmNode {
    pub id: u64,
    pub location: LatLng,
    pub tags: Vec<SourceTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsmWay {
    pub id: u64,
    pub tags: Vec<SourceTag>,
    pub nodes: Vec<u64>,
}

impl OsmWay {
    pub fn is_closed(&self) -> bool {
        self.nodes.len() > 2 && self.nodes.first() == self.nodes.last()
    }

    pub fn is_area(&self) -> bool {
        self.is_closed() && implies_area(&self.tags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsmElementType {
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsmMember {
    pub id: u64,
    pub element_type: OsmElementType,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsmRelation {
    pub id: u64,
    pub tags: Vec<SourceTag>,
    pub members: Vec<OsmMember>,
}

impl OsmRelation {
    pub fn is_multipolygon(&self) -> bool {
        tag(&self.tags, "type") == Some("multipolygon")
    }
}

/// OSM elements held in memory, read as features.
#[derive(Debug, Default)]
pub struct OsmSource {
    nodes: Vec<OsmNode>,
    ways: Vec<OsmWay>,
    relations: Vec<OsmRelation>,
    // closed ways, and whether they are areas by themselves
    closed_ways: AHashMap<u64, bool>,
    multipolygons: AHashSet<u64>,
}

impl OsmSource {
    pub fn new(nodes: Vec<OsmNode>, ways: Vec<OsmWay>, relations: Vec<OsmRelation>) -> Self {
        let closed_ways = ways
            .iter()
            .filter(|w| w.is_closed())
            .map(|w| (w.id, implies_area(&w.tags)))
            .collect();
        let multipolygons = relations
            .iter()
            .filter(|r| r.is_multipolygon())
            .map(|r| r.id)
            .collect();
        Self {
            nodes,
            ways,
            relations,
            closed_ways,
            multipolygons,
        }
    }

    pub fn nodes(&self) -> &[OsmNode] {
        &self.nodes
    }

    pub fn ways(&self) -> &[OsmWay] {
        &self.ways
    }

    pub fn relations(&self) -> &[OsmRelation] {
        &self.relations
    }

    pub fn point(&self, node: &OsmNode, options: &ReadOptions) -> PointFeature {
        PointFeature {
            id: FeatureId::osm_node(node.id),
            location: node.location,
            tags: self.tags(&node.tags, options),
        }
    }

    pub fn path(&self, way: &OsmWay, options: &ReadOptions) -> PathFeature {
        PathFeature {
            id: FeatureId::osm_way_path(way.id),
            tags: self.tags(&way.tags, options),
            vertices: way
                .nodes
                .iter()
                .map(|&id| SourceVertex::Point(FeatureId::osm_node(id)))
                .collect(),
        }
    }

    /// The area of a closed way, if its tags make it one.
    pub fn way_area(&self, way: &OsmWay, options: &ReadOptions) -> Option<AreaFeature> {
        if !way.is_area() {
            return None;
        }
        Some(AreaFeature {
            id: FeatureId::osm_way_area(way.id),
            tags: self.tags(&way.tags, options),
            polygons: vec![SourcePolygon::Paths(vec![FeatureId::osm_way_path(way.id)])],
        })
    }

    /// Reassembles a multipolygon from closed member ways.
    ///
    /// Each member with an outer (or empty) role starts a new polygon, the
    /// following inner members are its holes. Returns `None` if any member
    /// way is missing or not closed.
    pub fn multipolygon_area(
        &self,
        relation: &OsmRelation,
        options: &ReadOptions,
    ) -> Option<AreaFeature> {
        let mut polygons = Vec::new();
        let mut loops = Vec::new();
        for member in &relation.members {
            if member.element_type != OsmElementType::Way {
                continue;
            }
            if (member.role == "outer" || member.role.is_empty()) && !loops.is_empty() {
                polygons.push(SourcePolygon::Paths(std::mem::take(&mut loops)));
            }
            if !self.closed_ways.contains_key(&member.id) {
                debug!(
                    "Dropping multipolygon {}: way {} is missing or open",
                    relation.id, member.id
                );
                return None;
            }
            loops.push(FeatureId::osm_way_path(member.id));
        }
        if !loops.is_empty() {
            polygons.push(SourcePolygon::Paths(loops));
        }
        Some(AreaFeature {
            id: FeatureId::osm_relation_area(relation.id),
            tags: self.tags(&relation.tags, options),
            polygons,
        })
    }

    pub fn relation(&self, relation: &OsmRelation, options: &ReadOptions) -> RelationFeature {
        let members = relation
            .members
            .iter()
            .map(|m| SourceMember {
                id: self.member_id(m),
                role: m.role.clone(),
            })
            .collect();
        RelationFeature {
            id: FeatureId::osm_relation(relation.id),
            tags: self.tags(&relation.tags, options),
            members,
        }
    }

    /// Id of the feature an OSM member turns into.
    pub fn member_id(&self, member: &OsmMember) -> FeatureId {
        match member.element_type {
            OsmElementType::Node => FeatureId::osm_node(member.id),
            OsmElementType::Way => match self.closed_ways.get(&member.id) {
                Some(true) => FeatureId::osm_way_area(member.id),
                _ => FeatureId::osm_way_path(member.id),
            },
            OsmElementType::Relation => {
                if self.multipolygons.contains(&member.id) {
                    FeatureId::osm_relation_area(member.id)
                } else {
                    FeatureId::osm_relation(member.id)
                }
            }
        }
    }

    fn tags(&self, tags: &[SourceTag], options: &ReadOptions) -> Vec<SourceTag> {
        if options.skip_tags {
            Vec::new()
        } else {
            tags_from_osm(tags)
        }
    }
}

impl FeatureSource for OsmSource {
    fn read(&self, options: &ReadOptions, emit: &Emit) -> Result<()> {
        if !options.skip_points {
            self.nodes.par_iter().try_for_each(|node| {
                emit(&Feature::Point(self.point(node, options)), current_worker())
            })?;
        }
        if !options.skip_paths || !options.skip_areas {
            self.ways.par_iter().try_for_each(|way| {
                if !options.skip_paths {
                    emit(&Feature::Path(self.path(way, options)), current_worker())?;
                }
                if !options.skip_areas {
                    if let Some(area) = self.way_area(way, options) {
                        emit(&Feature::Area(area), current_worker())?;
                    }
                }
                Ok::<(), Error>(())
            })?;
        }
        if !options.skip_relations || !options.skip_areas {
            self.relations.par_iter().try_for_each(|relation| {
                if relation.is_multipolygon() {
                    if !options.skip_areas {
                        if let Some(area) = self.multipolygon_area(relation, options) {
                            emit(&Feature::Area(area), current_worker())?;
                        }
                    }
                } else if !options.skip_relations {
                    emit(
                        &Feature::Relation(self.relation(relation, options)),
                        current_worker(),
                    )?;
                }
                Ok::<(), Error>(())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::build::{build_in_memory, BuildOptions};
    use crate::ids::FeatureType;

    use parking_lot::Mutex;

    fn tags(pairs: &[(&str, &str)]) -> Vec<SourceTag> {
        pairs.iter().map(|(k, v)| SourceTag::new(*k, *v)).collect()
    }

    fn way(id: u64, nodes: &[u64], pairs: &[(&str, &str)]) -> OsmWay {
        OsmWay {
            id,
            tags: tags(pairs),
            nodes: nodes.to_vec(),
        }
    }

    fn member(id: u64, element_type: OsmElementType, role: &str) -> OsmMember {
        OsmMember {
            id,
            element_type,
            role: role.to_string(),
        }
    }

    fn read_all(source: &OsmSource, options: &ReadOptions) -> Vec<Feature> {
        let features = Mutex::new(Vec::new());
        source
            .read(options, &|f, _| {
                features.lock().push(f.clone());
                Ok(())
            })
            .unwrap();
        let mut features = features.into_inner();
        features.sort_by(|a, b| a.id().cmp(b.id()));
        features
    }

    #[test]
    fn test_key_mapping() {
        assert_eq!(key_for_osm_key("highway"), "#highway");
        assert_eq!(key_for_osm_key("wikidata"), "@wikidata");
        assert_eq!(key_for_osm_key("fhrs:id"), "@fhrs:id");
        assert_eq!(key_for_osm_key("name"), "name");
    }

    #[test]
    fn test_implies_area() {
        assert!(implies_area(&tags(&[("building", "yes")])));
        assert!(implies_area(&tags(&[("highway", "pedestrian"), ("area", "yes")])));
        assert!(!implies_area(&tags(&[("highway", "pedestrian"), ("landuse", "grass")])));
        assert!(!implies_area(&tags(&[("building", "yes"), ("area", "no")])));
        assert!(!implies_area(&tags(&[("barrier", "fence"), ("leisure", "park")])));
        assert!(!implies_area(&tags(&[("name", "Granary Square")])));
    }

    #[test]
    fn test_closed_ways_become_areas() {
        let source = OsmSource::new(
            vec![],
            vec![
                way(1, &[1, 2, 3, 1], &[("building", "yes")]),
                way(2, &[1, 2, 3, 1], &[("highway", "primary")]),
                way(3, &[1, 2, 3], &[("building", "yes")]),
            ],
            vec![],
        );
        let features = read_all(&source, &ReadOptions::default());
        let ids: Vec<_> = features.iter().map(|f| f.id().clone()).collect();
        assert_eq!(
            ids,
            vec![
                FeatureId::osm_way_path(1),
                FeatureId::osm_way_path(2),
                FeatureId::osm_way_path(3),
                FeatureId::osm_way_area(1),
            ]
        );
        match &features[3] {
            Feature::Area(area) => {
                assert_eq!(area.tags, tags(&[("#building", "yes")]));
                assert_eq!(
                    area.polygons,
                    vec![SourcePolygon::Paths(vec![FeatureId::osm_way_path(1)])]
                );
            }
            f => panic!("expected area, found {:?}", f),
        }

        let paths = read_all(&source, &ReadOptions::only(&[FeatureType::Path]));
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn test_multipolygons() {
        let source = OsmSource::new(
            vec![],
            vec![
                way(1, &[1, 2, 3, 1], &[]),
                way(2, &[4, 5, 6, 4], &[]),
                way(3, &[7, 8, 9, 7], &[]),
                way(4, &[1, 2], &[]),
            ],
            vec![
                OsmRelation {
                    id: 10,
                    tags: tags(&[("type", "multipolygon"), ("natural", "water")]),
                    members: vec![
                        member(1, OsmElementType::Way, "outer"),
                        member(2, OsmElementType::Way, "inner"),
                        member(3, OsmElementType::Way, ""),
                        member(5, OsmElementType::Node, "label"),
                    ],
                },
                OsmRelation {
                    id: 11,
                    tags: tags(&[("type", "multipolygon")]),
                    members: vec![member(4, OsmElementType::Way, "outer")],
                },
            ],
        );
        let areas = read_all(&source, &ReadOptions::only(&[FeatureType::Area]));
        assert_eq!(areas.len(), 1);
        match &areas[0] {
            Feature::Area(area) => {
                assert_eq!(area.id, FeatureId::osm_relation_area(10));
                assert_eq!(
                    area.polygons,
                    vec![
                        SourcePolygon::Paths(vec![
                            FeatureId::osm_way_path(1),
                            FeatureId::osm_way_path(2)
                        ]),
                        SourcePolygon::Paths(vec![FeatureId::osm_way_path(3)]),
                    ]
                );
                assert!(area.tags.contains(&SourceTag::new("#natural", "water")));
            }
            f => panic!("expected area, found {:?}", f),
        }
    }

    #[test]
    fn test_relation_member_ids() {
        let source = OsmSource::new(
            vec![],
            vec![
                way(1, &[1, 2, 3, 1], &[("building", "yes")]),
                way(2, &[1, 2], &[("highway", "primary")]),
            ],
            vec![
                OsmRelation {
                    id: 20,
                    tags: tags(&[("type", "multipolygon")]),
                    members: vec![],
                },
                OsmRelation {
                    id: 21,
                    tags: tags(&[("type", "route"), ("route", "bus")]),
                    members: vec![
                        member(7, OsmElementType::Node, "stop"),
                        member(1, OsmElementType::Way, ""),
                        member(2, OsmElementType::Way, ""),
                        member(20, OsmElementType::Relation, ""),
                        member(22, OsmElementType::Relation, ""),
                    ],
                },
            ],
        );
        let relations = read_all(&source, &ReadOptions::only(&[FeatureType::Relation]));
        assert_eq!(relations.len(), 1);
        match &relations[0] {
            Feature::Relation(relation) => {
                let ids: Vec<_> = relation.members.iter().map(|m| m.id.clone()).collect();
                assert_eq!(
                    ids,
                    vec![
                        FeatureId::osm_node(7),
                        FeatureId::osm_way_area(1),
                        FeatureId::osm_way_path(2),
                        FeatureId::osm_relation_area(20),
                        FeatureId::osm_relation(22),
                    ]
                );
                assert_eq!(relation.members[0].role, "stop");
                assert!(relation.tags.contains(&SourceTag::new("#route", "bus")));
            }
            f => panic!("expected relation, found {:?}", f),
        }
    }

    #[test]
    fn test_way_and_relation_areas_are_built() {
        let node = |id, lat, lng| OsmNode {
            id,
            location: LatLng::from_degrees(lat, lng),
            tags: vec![],
        };
        let source = OsmSource::new(
            vec![
                node(1, 51.530, -0.120),
                node(2, 51.530, -0.119),
                node(3, 51.531, -0.119),
                node(4, 51.532, -0.120),
                node(5, 51.532, -0.118),
                node(6, 51.534, -0.118),
            ],
            vec![
                way(1, &[1, 2, 3, 1], &[("building", "yes")]),
                way(2, &[4, 5, 6, 4], &[]),
            ],
            vec![
                OsmRelation {
                    id: 10,
                    tags: tags(&[("type", "multipolygon"), ("natural", "water")]),
                    members: vec![member(2, OsmElementType::Way, "outer")],
                },
                OsmRelation {
                    id: 11,
                    tags: tags(&[("type", "site")]),
                    members: vec![
                        member(1, OsmElementType::Way, ""),
                        member(10, OsmElementType::Relation, ""),
                    ],
                },
            ],
        );
        let options = BuildOptions {
            cores: 2,
            ..Default::default()
        };
        let world = build_in_memory(&source, &options).unwrap();

        let way_area = FeatureId::osm_way_area(1);
        let relation_area = FeatureId::osm_relation_area(10);
        for id in [&way_area, &relation_area] {
            let feature = world.find_feature_by_id(id).unwrap().unwrap();
            assert_eq!(&feature.id, id);
            assert_eq!(world.polygons(id).unwrap().map(|p| p.len()), Some(1));
        }
        assert_eq!(
            world.search("building=yes").unwrap().collect::<Vec<_>>(),
            vec![way_area.clone()]
        );
        assert_eq!(
            world.search("natural=water").unwrap().collect::<Vec<_>>(),
            vec![relation_area.clone()]
        );
        assert_eq!(
            world.find_areas_by_path(&FeatureId::osm_way_path(2)).unwrap(),
            vec![relation_area.clone()]
        );
        assert_eq!(
            world.find_relations_by_feature(&relation_area).unwrap(),
            vec![FeatureId::osm_relation(11)]
        );
        assert_eq!(
            world.find_relations_by_feature(&way_area).unwrap(),
            vec![FeatureId::osm_relation(11)]
        );
    }
}
