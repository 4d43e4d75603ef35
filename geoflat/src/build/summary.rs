//! First pass over a source: strings, namespaces, counts and the
//! relationships later passes need to fill in reverse references.

use crate::error::Result;
use crate::features::{PATH_KEY, POINT_KEY};
use crate::ids::{FeatureId, FeatureType, Namespace};
use crate::source::{Feature, FeatureSource, ReadOptions, SourcePolygon, SourceVertex};
use crate::strings::StringTableBuilder;

use ahash::{AHashMap, AHashSet};
use log::info;
use parking_lot::Mutex;
use rayon::prelude::*;

/// Number of features, and references to features, in one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub points: u64,
    pub paths: u64,
    pub areas: u64,
    pub relations: u64,
    /// Point references from path vertices.
    pub path_points: u64,
    /// Path references from area polygons.
    pub area_paths: u64,
    /// Point references from relation members.
    pub relation_points: u64,
}

impl Counts {
    fn add(&mut self, other: &Counts) {
        self.points += other.points;
        self.paths += other.paths;
        self.areas += other.areas;
        self.relations += other.relations;
        self.path_points += other.path_points;
        self.area_paths += other.area_paths;
        self.relation_points += other.relation_points;
    }

    /// Number of entries the point block of the namespace needs, including
    /// points that are only referenced.
    pub fn point_entries(&self) -> u64 {
        self.points.max(self.path_points + self.relation_points)
    }

    pub fn features(&self, feature_type: FeatureType) -> u64 {
        match feature_type {
            FeatureType::Point => self.point_entries(),
            FeatureType::Path => self.paths,
            FeatureType::Area => self.areas,
            FeatureType::Relation => self.relations,
            FeatureType::Invalid => 0,
        }
    }
}

/// Sorted `(from, to)` pairs, looked up by `from`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relationships(Vec<(FeatureId, FeatureId)>);

impl Relationships {
    fn finish(&mut self) {
        self.0.par_sort_unstable();
        self.0.dedup();
    }

    /// Every `to` recorded for `from`, in ascending order.
    pub fn targets<'a, 'b>(&'a self, from: &'b FeatureId) -> impl Iterator<Item = &'a FeatureId> + 'b
    where
        'a: 'b,
    {
        let start = self.0.partition_point(|(f, _)| f < from);
        self.0[start..]
            .iter()
            .take_while(move |(f, _)| f == from)
            .map(|(_, to)| to)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Default)]
struct Partial {
    strings: AHashMap<String, u64>,
    counts: AHashMap<Namespace, Counts>,
    closed_paths: Vec<FeatureId>,
    path_areas: Vec<(FeatureId, FeatureId)>,
    member_relations: Vec<(FeatureId, FeatureId)>,
}

impl Partial {
    fn string(&mut self, s: &str) {
        if let Some(count) = self.strings.get_mut(s) {
            *count += 1;
        } else {
            self.strings.insert(s.to_string(), 1);
        }
    }

    fn count(&mut self, id: &FeatureId) -> &mut Counts {
        self.counts.entry(id.namespace.clone()).or_default()
    }

    fn add(&mut self, feature: &Feature) {
        for tag in feature.tags() {
            self.string(&tag.key);
            self.string(&tag.value);
        }
        match feature {
            Feature::Point(point) => {
                self.string(POINT_KEY);
                self.count(&point.id).points += 1;
            }
            Feature::Path(path) => {
                self.string(PATH_KEY);
                self.count(&path.id).paths += 1;
                if path.is_closed() {
                    self.closed_paths.push(path.id.clone());
                }
                for vertex in &path.vertices {
                    if let SourceVertex::Point(id) = vertex {
                        self.count(id).path_points += 1;
                    }
                }
            }
            Feature::Area(area) => {
                self.count(&area.id).areas += 1;
                for polygon in &area.polygons {
                    if let SourcePolygon::Paths(paths) = polygon {
                        for path in paths {
                            self.count(path).area_paths += 1;
                            self.path_areas.push((path.clone(), area.id.clone()));
                        }
                    }
                }
            }
            Feature::Relation(relation) => {
                self.count(&relation.id).relations += 1;
                for member in &relation.members {
                    self.string(&member.role);
                    if member.id.feature_type == FeatureType::Point {
                        self.count(&member.id).relation_points += 1;
                    } else {
                        self.count(&member.id);
                    }
                    self.member_relations
                        .push((member.id.clone(), relation.id.clone()));
                }
            }
        }
    }
}

/// Everything learned from the summary pass.
#[derive(Debug, Default)]
pub struct Summary {
    pub strings: StringTableBuilder,
    /// Counts by namespace, covering every namespace a feature or a
    /// reference uses.
    pub counts: AHashMap<Namespace, Counts>,
    pub closed_paths: AHashSet<FeatureId>,
    /// Path to the areas using it.
    pub path_areas: Relationships,
    /// Feature to the relations it is a member of.
    pub member_relations: Relationships,
}

impl Summary {
    /// Reads the whole source once. `workers` is the number of threads
    /// the source is read with.
    pub fn collect(source: &dyn FeatureSource, workers: usize) -> Result<Self> {
        let partials: Vec<Mutex<Partial>> =
            (0..workers.max(1)).map(|_| Default::default()).collect();
        source.read(&ReadOptions::default(), &|feature, worker| {
            partials[worker % partials.len()].lock().add(feature);
            Ok(())
        })?;

        let mut summary = Summary::default();
        for partial in partials {
            let partial = partial.into_inner();
            summary.strings.merge(partial.strings);
            for (ns, counts) in partial.counts {
                summary.counts.entry(ns).or_default().add(&counts);
            }
            summary.closed_paths.extend(partial.closed_paths);
            summary.path_areas.0.extend(partial.path_areas);
            summary.member_relations.0.extend(partial.member_relations);
        }
        summary.path_areas.finish();
        summary.member_relations.finish();

        let total = summary
            .counts
            .values()
            .fold(Counts::default(), |mut total, counts| {
                total.add(counts);
                total
            });
        info!(
            "Summary: {} points, {} paths, {} areas, {} relations, {} strings, {} namespaces",
            total.points,
            total.paths,
            total.areas,
            total.relations,
            summary.strings.len(),
            summary.counts.len()
        );
        Ok(summary)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.counts.keys()
    }

    pub fn counts(&self, ns: &Namespace) -> Counts {
        self.counts.get(ns).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::{
        AreaFeature, MemorySource, PathFeature, PointFeature, RelationFeature, SourceMember,
        SourceTag,
    };
    use crate::values::LatLng;

    fn source() -> MemorySource {
        let node = |v| SourceVertex::Point(FeatureId::osm_node(v));
        MemorySource::new(vec![
            Feature::Point(PointFeature {
                id: FeatureId::osm_node(1),
                location: LatLng::new(0, 0),
                tags: vec![SourceTag::new("#amenity", "cafe")],
            }),
            Feature::Path(PathFeature {
                id: FeatureId::osm_way_path(10),
                tags: vec![SourceTag::new("#building", "yes")],
                vertices: vec![node(1), node(2), node(3), node(1)],
            }),
            Feature::Area(AreaFeature {
                id: FeatureId::osm_way_area(10),
                tags: vec![SourceTag::new("#building", "yes")],
                polygons: vec![SourcePolygon::Paths(vec![FeatureId::osm_way_path(10)])],
            }),
            Feature::Relation(RelationFeature {
                id: FeatureId::osm_relation(20),
                tags: vec![],
                members: vec![
                    SourceMember {
                        id: FeatureId::osm_node(1),
                        role: "label".into(),
                    },
                    SourceMember {
                        id: FeatureId::osm_way_area(10),
                        role: "".into(),
                    },
                ],
            }),
        ])
    }

    #[test]
    fn test_counts_and_relationships() {
        let summary = Summary::collect(&source(), 4).unwrap();
        let nodes = summary.counts(&"openstreetmap.org/node".into());
        assert_eq!(nodes.points, 1);
        assert_eq!(nodes.path_points, 4);
        assert_eq!(nodes.relation_points, 1);
        let ways = summary.counts(&"openstreetmap.org/way".into());
        assert_eq!((ways.paths, ways.areas, ways.area_paths), (1, 1, 1));
        assert_eq!(summary.counts(&"openstreetmap.org/relation".into()).relations, 1);
        assert!(summary.closed_paths.contains(&FeatureId::osm_way_path(10)));

        let areas: Vec<_> = summary
            .path_areas
            .targets(&FeatureId::osm_way_path(10))
            .collect();
        assert_eq!(areas, vec![&FeatureId::osm_way_area(10)]);
        let relations: Vec<_> = summary
            .member_relations
            .targets(&FeatureId::osm_node(1))
            .collect();
        assert_eq!(relations, vec![&FeatureId::osm_relation(20)]);
        assert_eq!(
            summary
                .member_relations
                .targets(&FeatureId::osm_node(2))
                .count(),
            0
        );
        // two tag pairs for the building, one for the cafe, the geometry
        // keys and two roles
        assert_eq!(summary.strings.len(), 8);
    }
}
