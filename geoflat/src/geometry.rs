//! Planar helpers over lat/lng rings, with longitude as x and latitude as y.

use crate::values::LatLng;

use geo::{Area, Coord, LineString, Polygon};

/// Closed line string through the vertices of `ring`.
fn line_string(ring: &[LatLng]) -> LineString<f64> {
    let mut line: LineString<f64> = ring
        .iter()
        .map(|ll| Coord {
            x: ll.lng(),
            y: ll.lat(),
        })
        .collect();
    line.close();
    line
}

/// Signed area of `ring` in squared degrees, positive for counter clockwise
/// rings. The ring may or may not repeat its first vertex.
pub fn signed_area(ring: &[LatLng]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    Polygon::new(line_string(ring), vec![]).signed_area()
}

pub fn is_clockwise(ring: &[LatLng]) -> bool {
    signed_area(ring) < 0.0
}

/// Drops the last vertex if it repeats the first one.
pub fn open_ring(mut ring: Vec<LatLng>) -> Vec<LatLng> {
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

/// Whether `ring` bounds a non empty region: at least three distinct
/// vertices and a non zero area.
pub fn is_valid_loop(ring: &[LatLng]) -> bool {
    let mut distinct: Vec<LatLng> = ring.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    distinct.len() >= 3 && signed_area(ring) != 0.0
}

/// Orients a polygon's loops: the outer boundary counter clockwise, the holes
/// clockwise.
pub fn orient_polygon(loops: &mut [Vec<LatLng>]) {
    for (i, ring) in loops.iter_mut().enumerate() {
        let outer = i == 0;
        if is_clockwise(ring) == outer {
            ring.reverse();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use proptest::prelude::*;

    fn ring(degrees: &[(f64, f64)]) -> Vec<LatLng> {
        degrees
            .iter()
            .map(|&(lat, lng)| LatLng::from_degrees(lat, lng))
            .collect()
    }

    #[test]
    fn test_signed_area() {
        let ccw = ring(&[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)]);
        assert!((signed_area(&ccw) - 1.0).abs() < 1e-9);
        assert!(!is_clockwise(&ccw));
        let mut cw = ccw.clone();
        cw.reverse();
        assert!(is_clockwise(&cw));
        assert!((signed_area(&cw) + 1.0).abs() < 1e-9);
        let mut closed = ccw.clone();
        closed.push(ccw[0]);
        assert!((signed_area(&closed) - signed_area(&ccw)).abs() < 1e-9);
        assert_eq!(open_ring(closed), ccw);
        assert_eq!(signed_area(&ccw[..2]), 0.0);
    }

    #[test]
    fn test_loop_validity() {
        assert!(is_valid_loop(&ring(&[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0)])));
        assert!(!is_valid_loop(&ring(&[(0.0, 0.0), (0.0, 1.0), (0.0, 0.0)])));
        assert!(!is_valid_loop(&ring(&[(0.0, 0.0), (0.0, 1.0), (0.0, 2.0)])));
        assert!(!is_clockwise(&ring(&[(0.0, 0.0), (0.0, 1.0), (0.0, 2.0)])));
    }

    #[test]
    fn test_orient_polygon() {
        let outer = ring(&[(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0)]);
        let hole = ring(&[(0.5, 0.5), (0.5, 1.0), (1.0, 1.0), (1.0, 0.5)]);
        let mut polygon = vec![outer.clone(), hole.clone()];
        orient_polygon(&mut polygon);
        assert!(!is_clockwise(&polygon[0]));
        assert!(is_clockwise(&polygon[1]));
        assert!(signed_area(&polygon[0]) > 0.0);
        // both loops were the wrong way round
        let mut outer = outer;
        outer.reverse();
        let mut hole = hole;
        hole.reverse();
        assert_eq!(polygon, vec![outer, hole]);
    }

    proptest! {
        #[test]
        fn orientation_matches_area_sign(ref vertices in prop::collection::vec((-800i32..800, -800i32..800), 3..12)) {
            let ring: Vec<LatLng> = vertices
                .iter()
                .map(|&(lat, lng)| LatLng::from_degrees(f64::from(lat) / 10.0, f64::from(lng) / 10.0))
                .collect();
            let area = signed_area(&ring);
            let mut loops = vec![ring.clone()];
            orient_polygon(&mut loops);
            prop_assert!((signed_area(&loops[0]) - area.abs()).abs() <= 1e-9 * area.abs().max(1.0));
            let (mut before, mut after) = (ring, loops.remove(0));
            before.sort_unstable();
            after.sort_unstable();
            prop_assert_eq!(before, after);
        }
    }
}
