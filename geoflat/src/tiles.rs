//! Web-mercator tiles used as spatial search tokens.

use crate::values::LatLng;

use std::f64::consts::PI;
use std::fmt;

/// Deepest level that gets indexed.
pub const MAX_LEVEL: u8 = 16;
/// Largest number of tiles used to cover one feature.
pub const MAX_TILES: usize = 4;

const MAX_LATITUDE: f64 = 85.051_128_78;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl Tile {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Tile containing `ll` at level `z`.
    pub fn containing(ll: LatLng, z: u8) -> Self {
        let n = (1u64 << z) as f64;
        let max = (1u32 << z) - 1;
        let x = (ll.lng() + 180.0) / 360.0 * n;
        let lat = ll.lat().clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
        let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n;
        Self {
            z,
            x: (x.max(0.0) as u32).min(max),
            y: (y.max(0.0) as u32).min(max),
        }
    }

    pub fn parent(&self) -> Option<Tile> {
        if self.z == 0 {
            None
        } else {
            Some(Tile::new(self.z - 1, self.x / 2, self.y / 2))
        }
    }

    /// Ancestors from the parent up to level 1.
    pub fn ancestors(&self) -> impl Iterator<Item = Tile> {
        std::iter::successors(self.parent(), Tile::parent).take_while(|t| t.z > 0)
    }

    /// Search token for features covered by this tile.
    pub fn token(&self) -> String {
        format!("t:{}", self)
    }

    /// Search token for features covered by a descendant of this tile.
    pub fn ancestor_token(&self) -> String {
        format!("a:{}", self)
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Axis aligned bounds in E7 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub lo: LatLng,
    pub hi: LatLng,
}

impl Bounds {
    pub fn from_point(ll: LatLng) -> Self {
        Self { lo: ll, hi: ll }
    }

    pub fn extend(&mut self, ll: LatLng) {
        self.lo.lat_e7 = self.lo.lat_e7.min(ll.lat_e7);
        self.lo.lng_e7 = self.lo.lng_e7.min(ll.lng_e7);
        self.hi.lat_e7 = self.hi.lat_e7.max(ll.lat_e7);
        self.hi.lng_e7 = self.hi.lng_e7.max(ll.lng_e7);
    }

    pub fn from_points<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a LatLng>,
    {
        let mut points = points.into_iter();
        let mut bounds = Bounds::from_point(*points.next()?);
        for ll in points {
            bounds.extend(*ll);
        }
        Some(bounds)
    }
}

/// Tiles at the deepest level up to `MAX_LEVEL` where at most `MAX_TILES`
/// cover `bounds`. Level 0 is never used.
pub fn covering(bounds: &Bounds) -> Vec<Tile> {
    for z in (1..=MAX_LEVEL).rev() {
        // north has the smaller y
        let nw = Tile::containing(LatLng::new(bounds.hi.lat_e7, bounds.lo.lng_e7), z);
        let se = Tile::containing(LatLng::new(bounds.lo.lat_e7, bounds.hi.lng_e7), z);
        let count = (se.x - nw.x + 1) as usize * (se.y - nw.y + 1) as usize;
        if count <= MAX_TILES {
            return (nw.y..=se.y)
                .flat_map(|y| (nw.x..=se.x).map(move |x| Tile::new(z, x, y)))
                .collect();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tile_containing() {
        let ll = LatLng::from_degrees(51.5354124, -0.1145445);
        assert_eq!(Tile::containing(ll, 16), Tile::new(16, 32747, 21784));
        assert_eq!(Tile::containing(ll, 1), Tile::new(1, 0, 0));
        assert_eq!(Tile::containing(LatLng::new(0, 0), 16), Tile::new(16, 32768, 32768));
        let south_pole = Tile::containing(LatLng::from_degrees(-90.0, 180.0), 4);
        assert_eq!(south_pole, Tile::new(4, 15, 15));
    }

    #[test]
    fn test_ancestors() {
        let tile = Tile::new(4, 9, 5);
        assert_eq!(tile.parent(), Some(Tile::new(3, 4, 2)));
        assert_eq!(
            tile.ancestors().collect::<Vec<_>>(),
            vec![Tile::new(3, 4, 2), Tile::new(2, 2, 1), Tile::new(1, 1, 0)]
        );
        assert_eq!(Tile::new(0, 0, 0).parent(), None);
        assert_eq!(tile.token(), "t:4/9/5");
        assert_eq!(tile.ancestor_token(), "a:4/9/5");
    }

    #[test]
    fn test_point_covering() {
        let ll = LatLng::from_degrees(51.5354124, -0.1145445);
        assert_eq!(
            covering(&Bounds::from_point(ll)),
            vec![Tile::new(16, 32747, 21784)]
        );
    }

    #[test]
    fn test_large_covering() {
        let bounds = Bounds::from_points(&[
            LatLng::from_degrees(51.0, -1.0),
            LatLng::from_degrees(52.0, 1.0),
        ])
        .unwrap();
        let tiles = covering(&bounds);
        assert!(!tiles.is_empty() && tiles.len() <= MAX_TILES);
        let z = tiles[0].z;
        assert!(z < MAX_LEVEL && z > 0);
        assert!(tiles.iter().all(|t| t.z == z));

        let world = Bounds::from_points(&[
            LatLng::from_degrees(-80.0, -179.0),
            LatLng::from_degrees(80.0, 179.0),
        ])
        .unwrap();
        assert_eq!(covering(&world).len(), 4);
    }
}
