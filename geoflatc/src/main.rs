mod args;
mod osmpbf;
mod stats;

use crate::osmpbf::{build_block_index, read_block, relation::MemberType, BlockIndex, BlockType};
use crate::stats::Stats;

use clap::Parser;
use colored::*;
use geoflat::{
    build, parallel_process, BuildOptions, FileOutput, LatLng, LocationsById, NoLocations,
    OsmElementType, OsmMember, OsmNode, OsmRelation, OsmSource, OsmWay, SourceTag, World,
};
use log::info;
use memmap2::Mmap;
use pbr::ProgressBar;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str;

type Error = Box<dyn std::error::Error>;

const SUPPORTED_FEATURES: &[&str] = &["OsmSchema-V0.6", "DenseNodes"];

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn check_header(header: &osmpbf::HeaderBlock) -> Result<(), Error> {
    for feature in &header.required_features {
        if !SUPPORTED_FEATURES.contains(&feature.as_str()) {
            return Err(format!("unsupported required feature {}", feature).into());
        }
    }
    if let Some(program) = &header.writingprogram {
        info!("Input written by {}", program);
    }
    Ok(())
}

/// Elements converted from one or more blocks.
#[derive(Debug, Default)]
struct Elements {
    nodes: Vec<OsmNode>,
    ways: Vec<OsmWay>,
    relations: Vec<OsmRelation>,
    stats: Stats,
}

impl Elements {
    fn extend(&mut self, other: Elements) {
        self.nodes.extend(other.nodes);
        self.ways.extend(other.ways);
        self.relations.extend(other.relations);
        self.stats += other.stats;
    }
}

fn string_table(block: &osmpbf::PrimitiveBlock) -> io::Result<Vec<&str>> {
    block
        .stringtable
        .s
        .iter()
        .map(|s| str::from_utf8(s).map_err(|e| invalid_data(e.to_string())))
        .collect()
}

fn string<'a>(strings: &[&'a str], i: i64) -> io::Result<&'a str> {
    usize::try_from(i)
        .ok()
        .and_then(|i| strings.get(i))
        .copied()
        .ok_or_else(|| invalid_data(format!("string {} out of range", i)))
}

fn tags(strings: &[&str], keys: &[u32], vals: &[u32]) -> io::Result<Vec<SourceTag>> {
    if keys.len() != vals.len() {
        return Err(invalid_data("keys and values of different length"));
    }
    keys.iter()
        .zip(vals)
        .map(|(&k, &v)| {
            Ok(SourceTag::new(
                string(strings, k.into())?,
                string(strings, v.into())?,
            ))
        })
        .collect()
}

/// Location of block coordinates, in units of the block's granularity.
fn location(block: &osmpbf::PrimitiveBlock, lat: i64, lon: i64) -> LatLng {
    let granularity = i64::from(block.granularity.unwrap_or(100));
    // nanodegrees to 1e-7 degrees
    let lat = (block.lat_offset.unwrap_or(0) + granularity * lat) / 100;
    let lon = (block.lon_offset.unwrap_or(0) + granularity * lon) / 100;
    LatLng::new(lat as i32, lon as i32)
}

fn dense_nodes(
    block: &osmpbf::PrimitiveBlock,
    dense: &osmpbf::DenseNodes,
    strings: &[&str],
    nodes: &mut Vec<OsmNode>,
) -> io::Result<()> {
    if dense.lat.len() != dense.id.len() || dense.lon.len() != dense.id.len() {
        return Err(invalid_data("dense nodes of different length"));
    }
    let (mut id, mut lat, mut lon) = (0, 0, 0);
    // empty when no node of the block has tags
    let mut keys_vals = dense.keys_vals.iter();
    for i in 0..dense.id.len() {
        id += dense.id[i];
        lat += dense.lat[i];
        lon += dense.lon[i];

        let mut tags = Vec::new();
        while let Some(&k) = keys_vals.next() {
            if k == 0 {
                break; // separator
            }
            let v = *keys_vals
                .next()
                .ok_or_else(|| invalid_data("dense node key without value"))?;
            tags.push(SourceTag::new(
                string(strings, k.into())?,
                string(strings, v.into())?,
            ));
        }
        nodes.push(OsmNode {
            id: id as u64,
            location: location(block, lat, lon),
            tags,
        });
    }
    Ok(())
}

fn relation(
    pbf_relation: &osmpbf::Relation,
    strings: &[&str],
    stats: &mut Stats,
) -> io::Result<OsmRelation> {
    if pbf_relation.roles_sid.len() != pbf_relation.memids.len()
        || pbf_relation.memids.len() != pbf_relation.types.len()
    {
        return Err(invalid_data(format!(
            "members of relation {} of different length",
            pbf_relation.id
        )));
    }
    let mut members = Vec::with_capacity(pbf_relation.memids.len());
    let mut memid = 0;
    for i in 0..pbf_relation.memids.len() {
        memid += pbf_relation.memids[i];
        let element_type = match MemberType::from_i32(pbf_relation.types[i]) {
            Some(MemberType::Node) => OsmElementType::Node,
            Some(MemberType::Way) => OsmElementType::Way,
            Some(MemberType::Relation) => OsmElementType::Relation,
            None => {
                stats.num_unknown_members += 1;
                continue;
            }
        };
        members.push(OsmMember {
            id: memid as u64,
            element_type,
            role: string(strings, pbf_relation.roles_sid[i].into())?.to_string(),
        });
    }
    Ok(OsmRelation {
        id: pbf_relation.id as u64,
        tags: tags(strings, &pbf_relation.keys, &pbf_relation.vals)?,
        members,
    })
}

fn convert_block(block: &osmpbf::PrimitiveBlock) -> io::Result<Elements> {
    let strings = string_table(block)?;
    let mut elements = Elements::default();
    for group in &block.primitivegroup {
        for node in &group.nodes {
            elements.nodes.push(OsmNode {
                id: node.id as u64,
                location: location(block, node.lat, node.lon),
                tags: tags(&strings, &node.keys, &node.vals)?,
            });
        }
        if let Some(dense) = &group.dense {
            dense_nodes(block, dense, &strings, &mut elements.nodes)?;
        }
        for pbf_way in &group.ways {
            let mut node_ref = 0;
            elements.ways.push(OsmWay {
                id: pbf_way.id as u64,
                tags: tags(&strings, &pbf_way.keys, &pbf_way.vals)?,
                nodes: pbf_way
                    .refs
                    .iter()
                    .map(|delta| {
                        node_ref += delta;
                        node_ref as u64
                    })
                    .collect(),
            });
        }
        for pbf_relation in &group.relations {
            let relation = relation(pbf_relation, &strings, &mut elements.stats)?;
            elements.relations.push(relation);
        }
    }
    elements.stats.num_blocks = 1;
    elements.stats.num_nodes = elements.nodes.len();
    elements.stats.num_ways = elements.ways.len();
    elements.stats.num_relations = elements.relations.len();
    Ok(elements)
}

fn convert_blocks(data: &[u8], blocks: Vec<BlockIndex>, message: &str) -> Result<Elements, Error> {
    let mut result = Elements::default();
    let mut pb = ProgressBar::new(blocks.len() as u64);
    pb.message(message);
    parallel_process(
        blocks.into_iter(),
        |idx| read_block(data, &idx).and_then(|block| convert_block(&block)),
        |elements: io::Result<Elements>| -> Result<(), Error> {
            result.extend(elements?);
            pb.inc();
            Ok(())
        },
    )?;
    pb.finish();
    Ok(result)
}

/// Reads all elements of the PBF file in `data`.
fn read_source(data: &[u8], block_index: Vec<BlockIndex>) -> Result<(OsmSource, Stats), Error> {
    let mut pbf_header = Vec::new();
    let mut pbf_nodes = Vec::new();
    let mut pbf_ways = Vec::new();
    let mut pbf_relations = Vec::new();
    for block in block_index {
        match block.block_type {
            BlockType::Header => pbf_header.push(block),
            BlockType::Nodes | BlockType::DenseNodes => pbf_nodes.push(block),
            BlockType::Ways => pbf_ways.push(block),
            BlockType::Relations => pbf_relations.push(block),
        }
    }

    if pbf_header.len() != 1 {
        return Err(format!(
            "Require exactly one header block, but found {}",
            pbf_header.len()
        )
        .into());
    }
    let header: osmpbf::HeaderBlock = read_block(data, &pbf_header[0])?;
    check_header(&header)?;

    let mut elements = convert_blocks(data, pbf_nodes, "Converting nodes...")?;
    elements.extend(convert_blocks(data, pbf_ways, "Converting ways...")?);
    elements.extend(convert_blocks(
        data,
        pbf_relations,
        "Converting relations...",
    )?);
    let Elements {
        nodes,
        ways,
        relations,
        stats,
    } = elements;
    Ok((OsmSource::new(nodes, ways, relations), stats))
}

fn scratch_dir(args: &args::Args) -> PathBuf {
    match &args.scratch_dir {
        Some(dir) => dir.clone(),
        None => args
            .output
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
    }
}

fn run(args: args::Args) -> Result<(), Error> {
    let cores = args
        .cores
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
    rayon::ThreadPoolBuilder::new()
        .num_threads(cores)
        .build_global()?;

    let input_file = File::open(&args.input)?;
    let input_data = unsafe { Mmap::map(&input_file)? };

    info!("Building index of PBF blocks...");
    let block_index = build_block_index(&input_data)?;
    let (source, stats) = read_source(&input_data, block_index)?;
    info!("PBF file read.");

    let base = match &args.base {
        Some(path) => {
            info!("Building on top of {}", path.display());
            Some(World::open(path)?)
        }
        None => None,
    };
    let locations: &dyn LocationsById = match &base {
        Some(world) => world,
        None => &NoLocations,
    };

    let options = BuildOptions {
        cores,
        fail_invalid_features: args.fail_invalid,
        scratch_dir: Some(scratch_dir(&args)),
        ..Default::default()
    };
    let output = FileOutput::new(args.output.clone());
    let build_stats = build(&source, locations, &options, &output)?;
    info!("geoflat blob built at: {}", args.output.display());

    let features = World::open(&args.output)?.verify()?;
    info!("verified that all {} features of the geoflat blob decode.", features);

    println!("{stats}");
    println!("{build_stats}");
    Ok(())
}

fn main() {
    let args = args::Args::parse();
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_module_path(false)
        .format_timestamp_nanos()
        .init();

    if let Err(e) = run(args) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::osmpbf::test::{blob, header, primitive_block};
    use crate::osmpbf::{DenseNodes, PrimitiveGroup, Relation, Way};

    use geoflat::{build_in_memory, FeatureId};
    use proptest::prelude::*;

    const STRINGS: &[&str] = &[
        "", "amenity", "cafe", "building", "yes", "type", "site", "entrance",
    ];

    /// A cafe, a building around it and a relation of both.
    fn pbf() -> Vec<u8> {
        let nodes = primitive_block(
            STRINGS,
            PrimitiveGroup {
                dense: Some(DenseNodes {
                    id: vec![1, 1, 1],
                    lat: vec![515_000_000, 0, 100_000],
                    lon: vec![-1_000_000, 100_000, -50_000],
                    keys_vals: vec![1, 2, 0, 0, 0],
                }),
                ..Default::default()
            },
        );
        let ways = primitive_block(
            STRINGS,
            PrimitiveGroup {
                ways: vec![Way {
                    id: 10,
                    keys: vec![3],
                    vals: vec![4],
                    refs: vec![1, 2, -1, -1],
                }],
                ..Default::default()
            },
        );
        let relations = primitive_block(
            STRINGS,
            PrimitiveGroup {
                relations: vec![Relation {
                    id: 20,
                    keys: vec![5],
                    vals: vec![6],
                    roles_sid: vec![7, 0, 0],
                    memids: vec![1, 9, 5],
                    types: vec![MemberType::Node as i32, MemberType::Way as i32, 7],
                }],
                ..Default::default()
            },
        );

        let mut data = blob("OSMHeader", &header());
        data.extend(blob("OSMData", &relations));
        data.extend(blob("OSMData", &nodes));
        data.extend(blob("OSMData", &ways));
        data
    }

    #[test]
    fn test_read_source() {
        let data = pbf();
        let (source, stats) = read_source(&data, build_block_index(&data).unwrap()).unwrap();
        assert_eq!(
            stats,
            Stats {
                num_blocks: 3,
                num_nodes: 3,
                num_ways: 1,
                num_relations: 1,
                num_unknown_members: 1,
            }
        );

        let nodes: Vec<_> = source
            .nodes()
            .iter()
            .map(|n| (n.id, n.location, n.tags.len()))
            .collect();
        assert_eq!(
            nodes,
            vec![
                (1, LatLng::new(515_000_000, -1_000_000), 1),
                (2, LatLng::new(515_000_000, -900_000), 0),
                (3, LatLng::new(515_100_000, -950_000), 0),
            ]
        );
        assert_eq!(source.ways()[0].nodes, vec![1, 3, 2, 1]);
        let members: Vec<_> = source.relations()[0]
            .members
            .iter()
            .map(|m| (m.id, m.element_type, m.role.as_str()))
            .collect();
        assert_eq!(
            members,
            vec![(1, OsmElementType::Node, "entrance"), (10, OsmElementType::Way, "")]
        );
    }

    #[test]
    fn test_build_from_pbf() {
        let data = pbf();
        let (source, _) = read_source(&data, build_block_index(&data).unwrap()).unwrap();
        let options = BuildOptions {
            cores: 2,
            ..Default::default()
        };
        let world = build_in_memory(&source, &options).unwrap();

        let found: Vec<_> = world.search("building=yes").unwrap().collect();
        assert_eq!(
            found,
            vec![FeatureId::osm_way_path(10), FeatureId::osm_way_area(10)]
        );
        assert_eq!(
            world
                .find_relations_by_feature(&FeatureId::osm_way_area(10))
                .unwrap(),
            vec![FeatureId::osm_relation(20)]
        );
        assert_eq!(
            world.find_location_by_id(&FeatureId::osm_node(3)).unwrap(),
            Some(LatLng::new(515_100_000, -950_000))
        );
    }

    #[test]
    fn test_requires_one_header() {
        let data = pbf();
        let mut index = build_block_index(&data).unwrap();
        index.remove(0);
        assert!(read_source(&data, index).is_err());

        let mut unsupported = header();
        unsupported.required_features.push("HistoricalInformation".into());
        assert!(check_header(&unsupported).is_err());
        assert!(check_header(&header()).is_ok());
    }

    fn delta(values: &[i64]) -> Vec<i64> {
        let mut last = 0;
        values
            .iter()
            .map(|&v| {
                let d = v - last;
                last = v;
                d
            })
            .collect()
    }

    proptest! {
        #[test]
        fn dense_nodes_decode_deltas(
            nodes in prop::collection::vec(
                (1i64..1 << 40, -900_000_000i64..900_000_000, -1_800_000_000i64..1_800_000_000),
                0..50,
            ),
        ) {
            let ids: Vec<_> = nodes.iter().map(|n| n.0).collect();
            let lats: Vec<_> = nodes.iter().map(|n| n.1).collect();
            let lons: Vec<_> = nodes.iter().map(|n| n.2).collect();
            let dense = DenseNodes {
                id: delta(&ids),
                lat: delta(&lats),
                lon: delta(&lons),
                keys_vals: vec![],
            };
            let block = primitive_block(&[""], PrimitiveGroup::default());

            let mut decoded = Vec::new();
            dense_nodes(&block, &dense, &[""], &mut decoded).unwrap();
            let decoded: Vec<_> = decoded
                .iter()
                .map(|n| (n.id as i64, i64::from(n.location.lat_e7), i64::from(n.location.lng_e7)))
                .collect();
            prop_assert_eq!(decoded, nodes);
        }
    }
}
