//! Great-circle distance and extraction of coordinates from address text and map links.

use reqwest::Url;

use crate::model::Coordinate;

/// Mean Earth radius used for haversine distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in kilometres.
#[must_use]
pub fn haversine_km(from: Coordinate, to: Coordinate) -> f64 {
    let (lat1, lat2) = (from.lat.to_radians(), to.lat.to_radians());
    let dlat = (to.lat - from.lat).to_radians();
    let dlng = (to.lng - from.lng).to_radians();
    let s1 = (dlat / 2.0).sin();
    let s2 = (dlng / 2.0).sin();
    let hav = s1 * s1 + lat1.cos() * lat2.cos() * s2 * s2;
    2.0 * EARTH_RADIUS_KM * hav.sqrt().min(1.0).asin()
}

/// A map-service link found in address text.
#[derive(Debug, Clone, PartialEq)]
pub enum MapLink {
    /// Shortened link that must be expanded before it can be parsed.
    Short(String),
    /// Full link; carries the coordinate if one could be read from it.
    Long(Option<Coordinate>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisOrder {
    LatLng,
    LngLat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Generic,
    Yandex,
    TwoGis,
}

/// Parse a decimal `lat, lng` pair written directly in the text, ignoring any links.
///
/// Both numbers need a decimal point; they may be separated by commas, semicolons or whitespace.
#[must_use]
pub fn parse_coordinate_pair(text: &str) -> Option<Coordinate> {
    let plain = text
        .split_whitespace()
        .filter(|word| !looks_like_link(word))
        .collect::<Vec<_>>()
        .join(" ");

    let tokens = numeric_tokens(&plain);
    tokens.windows(2).find_map(|pair| match pair {
        [(first, _, first_end), (second, second_start, _)] => {
            let gap = plain.get(*first_end..*second_start)?;
            let separated = !gap.is_empty()
                && gap
                    .chars()
                    .all(|ch| ch.is_whitespace() || ch == ',' || ch == ';');
            if !separated {
                return None;
            }
            Coordinate::new(*first, *second)
        }
        _ => None,
    })
}

/// Every `http(s)://` link in the text, in order, stripped of surrounding punctuation.
pub fn links(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|ch: char| {
                matches!(
                    ch,
                    '(' | ')' | '[' | ']' | '<' | '>' | '"' | '\'' | ',' | '.' | ';' | ':' | '!' | '?'
                )
            })
        })
        .filter(|word| looks_like_link(word))
}

/// First link in the text that points at a place: a short link to expand, or a long
/// link carrying coordinates. Other links (shops, menus) are skipped.
#[must_use]
pub fn find_map_link(text: &str, short_hosts: &[String]) -> Option<MapLink> {
    links(text).find_map(|link| match classify_link(link, short_hosts) {
        Some(MapLink::Long(None)) | None => None,
        usable => usable,
    })
}

/// Classify a link as short or long, reading coordinates out of long links.
///
/// `short_hosts` lists hosts whose links always redirect (e.g. `maps.app.goo.gl`).
#[must_use]
pub fn classify_link(raw: &str, short_hosts: &[String]) -> Option<MapLink> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(host.as_str());

    let listed_short = short_hosts
        .iter()
        .any(|short| short.eq_ignore_ascii_case(host));
    let yandex_short = host.contains("yandex.") && url.path().starts_with("/maps/-/");
    if listed_short || yandex_short {
        return Some(MapLink::Short(raw.to_owned()));
    }

    Some(MapLink::Long(coordinate_from_url(&url)))
}

/// Read a coordinate out of a long map link.
#[must_use]
pub fn coordinate_from_url(url: &Url) -> Option<Coordinate> {
    let host = url.host_str().unwrap_or_default().to_lowercase();
    let family = if host.contains("yandex.") {
        Family::Yandex
    } else if host.contains("2gis.") {
        Family::TwoGis
    } else {
        Family::Generic
    };

    from_query(url, family)
        .or_else(|| from_path(url.path(), family))
        .or_else(|| url.fragment().and_then(from_osm_fragment))
}

fn from_query(url: &Url, family: Family) -> Option<Coordinate> {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let lookup = |name: &str| {
        pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };

    let keyed = match family {
        Family::Yandex => ["pt", "whatshere[point]", "ll"]
            .iter()
            .find_map(|key| lookup(key).and_then(|value| parse_pair(value, AxisOrder::LngLat))),
        Family::TwoGis => lookup("m").and_then(|value| parse_pair(value, AxisOrder::LngLat)),
        Family::Generic => ["q", "query", "destination", "daddr", "ll", "center"]
            .iter()
            .find_map(|key| lookup(key).and_then(|value| parse_pair(value, AxisOrder::LatLng))),
    };

    keyed.or_else(|| {
        let lat = lookup("mlat")?.trim().parse().ok()?;
        let lng = lookup("mlon")?.trim().parse().ok()?;
        Coordinate::new(lat, lng)
    })
}

fn from_path(path: &str, family: Family) -> Option<Coordinate> {
    if family == Family::TwoGis {
        let mut segments = path.split('/');
        while let Some(segment) = segments.next() {
            if segment == "geo" {
                return segments.find_map(|candidate| parse_pair(candidate, AxisOrder::LngLat));
            }
        }
        return None;
    }

    // Place pins (`!3d<lat>!4d<lng>`) are more precise than the viewport centre (`@lat,lng`).
    if let Some(pin) = data_pin(path) {
        return Some(pin);
    }
    path.split('/')
        .filter_map(|segment| segment.strip_prefix('@'))
        .find_map(|viewport| parse_pair(viewport, AxisOrder::LatLng))
}

fn data_pin(path: &str) -> Option<Coordinate> {
    let lat_start = path.find("!3d")?;
    let rest = path.get(lat_start + 3..)?;
    let lng_start = rest.find("!4d")?;
    let lat = rest.get(..lng_start)?.parse().ok()?;
    let tail = rest.get(lng_start + 3..)?;
    let lng_end = tail.find(|ch: char| ch == '!' || ch == '?' || ch == '/').unwrap_or(tail.len());
    let lng = tail.get(..lng_end)?.parse().ok()?;
    Coordinate::new(lat, lng)
}

fn from_osm_fragment(fragment: &str) -> Option<Coordinate> {
    let map = fragment.strip_prefix("map=")?;
    let mut parts = map.split('/').skip(1);
    let lat = parts.next()?.parse().ok()?;
    let lng = parts.next()?.parse().ok()?;
    Coordinate::new(lat, lng)
}

fn parse_pair(value: &str, order: AxisOrder) -> Option<Coordinate> {
    let mut parts = value.split(',');
    let first: f64 = parts.next()?.trim().parse().ok()?;
    let second_raw = parts.next()?.trim();
    // Trailing zoom/extra segments such as `76.9/16` or `76.9z`.
    let second_end = second_raw
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.' || ch == '-' || ch == '+'))
        .unwrap_or(second_raw.len());
    let second: f64 = second_raw.get(..second_end)?.parse().ok()?;
    match order {
        AxisOrder::LatLng => Coordinate::new(first, second),
        AxisOrder::LngLat => Coordinate::new(second, first),
    }
}

fn looks_like_link(word: &str) -> bool {
    let lowered = word
        .trim_start_matches(|ch: char| matches!(ch, '(' | '<' | '"' | '\''))
        .to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

/// Decimal numbers in `text` with their byte ranges.
fn numeric_tokens(text: &str) -> Vec<(f64, usize, usize)> {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut start: Option<usize> = None;
    for (offset, ch) in text.char_indices() {
        let numeric = ch.is_ascii_digit() || ch == '.' || ch == '-' || ch == '+';
        match (numeric, start) {
            (true, None) => start = Some(offset),
            (false, Some(begin)) => {
                ranges.push((begin, offset));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(begin) = start {
        ranges.push((begin, text.len()));
    }

    ranges
        .into_iter()
        .filter_map(|(begin, end)| {
            let slice = text.get(begin..end)?;
            if !is_decimal(slice) {
                return None;
            }
            slice.parse().ok().map(|value| (value, begin, end))
        })
        .collect()
}

fn is_decimal(slice: &str) -> bool {
    let digits = slice.trim_start_matches(['-', '+']);
    match digits.split_once('.') {
        Some((whole, fraction)) => {
            !whole.is_empty()
                && !fraction.is_empty()
                && whole.chars().all(|ch| ch.is_ascii_digit())
                && fraction.chars().all(|ch| ch.is_ascii_digit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["maps.app.goo.gl".to_owned(), "goo.gl".to_owned()]
    }

    #[test]
    fn haversine_one_degree_of_latitude() {
        let origin = Coordinate::new(0.0, 0.0).expect("valid");
        let north = Coordinate::new(1.0, 0.0).expect("valid");
        let km = haversine_km(origin, north);
        assert!((km - 111.19).abs() < 0.1, "got {km}");
        assert!(haversine_km(origin, origin).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_pair_from_plain_text() {
        let found = parse_coordinate_pair("Deliver to 43.2389, 76.8897 gate 2").expect("pair");
        assert!((found.lat - 43.2389).abs() < 1e-9);
        assert!((found.lng - 76.8897).abs() < 1e-9);

        let semicolon = parse_coordinate_pair("-33.86;151.21").expect("pair");
        assert!((semicolon.lat + 33.86).abs() < 1e-9);
    }

    #[test]
    fn ignores_integers_and_out_of_range_pairs() {
        assert!(parse_coordinate_pair("Abay ave 12, 45").is_none());
        assert!(parse_coordinate_pair("95.1, 20.5").is_none());
        assert!(parse_coordinate_pair("flat 4.5b").is_none());
    }

    #[test]
    fn pair_scan_skips_links() {
        let text = "https://yandex.ru/maps/?pt=76.9,43.2 call first";
        assert!(parse_coordinate_pair(text).is_none());
    }

    #[test]
    fn finds_links_inside_text() {
        let text = "Client says: (https://maps.app.goo.gl/abc123) ring twice";
        assert_eq!(links(text).collect::<Vec<_>>(), vec!["https://maps.app.goo.gl/abc123"]);
        assert_eq!(links("Main street 5").next(), None);
    }

    #[test]
    fn sentence_punctuation_is_not_part_of_link() {
        let text = "Pin: https://maps.app.goo.gl/xyz. Or https://goo.gl/abc; thanks";
        assert_eq!(
            links(text).collect::<Vec<_>>(),
            vec!["https://maps.app.goo.gl/xyz", "https://goo.gl/abc"]
        );
    }

    #[test]
    fn map_link_search_skips_other_links() {
        let text = "menu https://example.com/menu deliver https://maps.google.com/?q=43.25,76.95";
        assert_eq!(
            find_map_link(text, &hosts()),
            Some(MapLink::Long(Coordinate::new(43.25, 76.95)))
        );
        assert_eq!(find_map_link("see https://example.com/menu", &hosts()), None);
    }

    #[test]
    fn classifies_short_links() {
        let link = classify_link("https://maps.app.goo.gl/abc123", &hosts());
        assert_eq!(link, Some(MapLink::Short("https://maps.app.goo.gl/abc123".to_owned())));

        let yandex = classify_link("https://yandex.kz/maps/-/CDqZ4Y~n", &hosts());
        assert!(matches!(yandex, Some(MapLink::Short(_))));
    }

    #[test]
    fn reads_google_viewport_and_pin() {
        let viewport = classify_link(
            "https://www.google.com/maps/place/Somewhere/@43.2389,76.8897,17z",
            &hosts(),
        );
        let Some(MapLink::Long(Some(found))) = viewport else {
            panic!("expected long link with coordinate, got {viewport:?}");
        };
        assert!((found.lat - 43.2389).abs() < 1e-9);

        let pinned = classify_link(
            "https://www.google.com/maps/place/X/@43.0,76.0,17z/data=!3m1!4b1!4m5!3m4!1s0x0:0x0!8m2!3d43.25!4d76.95",
            &hosts(),
        );
        let Some(MapLink::Long(Some(pin))) = pinned else {
            panic!("expected pin, got {pinned:?}");
        };
        assert!((pin.lat - 43.25).abs() < 1e-9);
        assert!((pin.lng - 76.95).abs() < 1e-9);
    }

    #[test]
    fn reads_query_styles() {
        let google = classify_link("https://maps.google.com/?q=51.5,-0.12", &hosts());
        assert_eq!(google, Some(MapLink::Long(Coordinate::new(51.5, -0.12))));

        let yandex = classify_link("https://yandex.ru/maps/?ll=76.95%2C43.25&z=16", &hosts());
        assert_eq!(yandex, Some(MapLink::Long(Coordinate::new(43.25, 76.95))));

        let two_gis = classify_link("https://2gis.kz/almaty?m=76.95%2C43.25%2F16", &hosts());
        assert_eq!(two_gis, Some(MapLink::Long(Coordinate::new(43.25, 76.95))));

        let osm = classify_link("https://www.openstreetmap.org/#map=17/52.52/13.40", &hosts());
        assert_eq!(osm, Some(MapLink::Long(Coordinate::new(52.52, 13.40))));
    }

    #[test]
    fn long_link_without_coordinates() {
        let link = classify_link("https://example.com/shop/contact", &hosts());
        assert_eq!(link, Some(MapLink::Long(None)));
    }
}
