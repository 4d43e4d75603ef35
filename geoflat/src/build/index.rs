//! Search index block: a token map followed by one posting list per token.

use super::{BuildContext, BuildStats};
use crate::arrays::ByteArraysBuilder;
use crate::blob::{BlockHeader, BlockType, BLOCK_HEADER_LEN};
use crate::error::{Context, Result};
use crate::ids::FeatureId;
use crate::output::{Output, ReadWriteAt};
use crate::parallel::parallel_process;
use crate::posting::{PostingKey, PostingList};
use crate::source::{current_worker, LocationsById};
use crate::tokens::{TokenFeature, TokenMapBuilder};
use crate::values::LatLng;
use crate::world::World;

use ahash::AHashMap;
use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;

/// Locations from the blob being indexed, then from the base world.
struct Overlay<'a> {
    world: &'a World,
    base: &'a dyn LocationsById,
}

impl<'a> LocationsById for Overlay<'a> {
    fn find_location_by_id(&self, id: &FeatureId) -> Option<LatLng> {
        LocationsById::find_location_by_id(self.world, id)
            .or_else(|| self.base.find_location_by_id(id))
    }
}

type Postings = AHashMap<String, Vec<PostingKey>>;

/// Tokenizes every feature of the blob in `output`, sorted by token, each
/// with its sorted and distinct posting keys.
fn collect_tokens(
    context: &BuildContext,
    output: &dyn Output,
    base: &dyn LocationsById,
) -> Result<Vec<(String, Vec<PostingKey>)>> {
    let blob = output.bytes().during("reading features back")?;
    let world = World::from_blob(blob)?;
    let locations = Overlay {
        world: &world,
        base,
    };

    let partials: Vec<Mutex<Postings>> = (0..rayon::current_num_threads().max(1))
        .map(|_| Default::default())
        .collect();
    for features in world.blobs() {
        features.par_each_feature(|feature| {
            if feature.is_references_only() {
                return Ok(());
            }
            let token_feature = TokenFeature {
                id: &feature.id,
                tags: feature.tags()?,
                bounds: world.bounds(&feature, &locations)?,
            };
            let tokens = context.options.tokenizer.tokens(&token_feature);
            if tokens.is_empty() {
                return Ok(());
            }
            let key = feature.posting_key();
            let mut partial = partials[current_worker() % partials.len()].lock();
            for token in tokens {
                partial.entry(token).or_default().push(key);
            }
            Ok(())
        })?;
    }

    let mut postings = Postings::default();
    for partial in partials {
        for (token, keys) in partial.into_inner() {
            postings.entry(token).or_default().extend(keys);
        }
    }
    let mut postings: Vec<_> = postings.into_iter().collect();
    postings.par_sort_unstable_by(|a, b| a.0.cmp(&b.0));
    postings.par_iter_mut().for_each(|(_, keys)| {
        keys.sort_unstable();
        keys.dedup();
    });
    Ok(postings)
}

fn encode(token: &str, keys: &[PostingKey]) -> Vec<u8> {
    let mut buffer = Vec::new();
    PostingList::from_sorted(token, keys.iter().copied()).marshal(&mut buffer);
    buffer
}

/// Writes the search index block at `offset`, returning the offset after it.
///
/// The features are read back from `output`, so everything written before
/// must be complete.
pub(crate) fn build_index(
    context: &BuildContext,
    output: &dyn Output,
    base: &dyn LocationsById,
    w: &dyn ReadWriteAt,
    offset: u64,
    stats: &mut BuildStats,
) -> Result<u64> {
    let postings = collect_tokens(context, output, base)?;
    debug!("Collected {} tokens", postings.len());

    let start = offset + BLOCK_HEADER_LEN as u64;
    let mut tokens = TokenMapBuilder::new();
    for (i, (token, _)) in postings.iter().enumerate() {
        tokens.add(token.as_str(), i);
    }
    let lists_offset = tokens.write(w, start)?;

    let mut lists = ByteArraysBuilder::new(postings.len());
    postings
        .par_iter()
        .enumerate()
        .for_each(|(i, (token, keys))| lists.reserve(i, encode(token, keys).len()));
    let end = lists.write_header(w, lists_offset)?;

    parallel_process(
        postings.iter().enumerate(),
        |(i, (token, keys))| (i, encode(token, keys)),
        |(i, data)| -> Result<Vec<u8>> {
            lists.write_item(w, i, &[data.as_slice()])?;
            Ok(data)
        },
    )?;
    lists.check_written()?;

    let header = BlockHeader {
        length: end - start,
        block_type: BlockType::SearchIndex,
    };
    w.write_at(&header.marshal(), offset)
        .during("writing search index")?;

    stats.tokens = postings.len() as u64;
    info!(
        "Index: {} tokens in {} token buckets",
        postings.len(),
        tokens.buckets()
    );
    Ok(end)
}
