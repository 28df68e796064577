use common::SongRecord;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AlbumKind {
    VariousArtists,
    Featured,
    SingleArtist,
}

/// Stamps `album_artist` on albums of a freshly extracted batch.
///
/// Songs are grouped by album name. An album whose primary artist changes
/// from track to track becomes a "Various Artists" album; one whose primary
/// artist is constant while featured artists vary gets that primary artist.
/// Albums with an explicit album artist on any track, a single track, an
/// empty name or duplicate track numbers are left alone.
pub fn classify(batch: &mut [SongRecord], separator: &str, various_label: &str) {
    for members in group_by_album(batch) {
        let first = &batch[members[0]];
        if first.album.is_empty() || members.len() < 2 {
            continue;
        }
        if members.iter().any(|&i| !batch[i].album_artist.is_empty()) {
            continue;
        }
        if tracks_overlap(batch, &members) {
            debug!("Album '{}' has overlapping track numbers; not grouping", first.album);
            continue;
        }

        match album_kind(batch, &members, separator) {
            AlbumKind::VariousArtists => {
                debug!("Album '{}' is a compilation", batch[members[0]].album);
                for &i in &members {
                    batch[i].album_artist = various_label.to_string();
                }
            }
            AlbumKind::Featured => {
                let primary = primary_artist(&batch[members[0]].artist, separator).to_string();
                debug!(
                    "Album '{}' credits '{}' with featured artists",
                    batch[members[0]].album, primary
                );
                for &i in &members {
                    batch[i].album_artist = primary.clone();
                }
            }
            AlbumKind::SingleArtist => {}
        }
    }
}

/// Indices of each album's songs, albums in first-seen order.
fn group_by_album(batch: &[SongRecord]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (index, song) in batch.iter().enumerate() {
        match groups
            .iter_mut()
            .find(|group| batch[group[0]].album == song.album)
        {
            Some(group) => group.push(index),
            None => groups.push(vec![index]),
        }
    }
    groups
}

fn tracks_overlap(batch: &[SongRecord], members: &[usize]) -> bool {
    let mut tracks: Vec<u32> = members.iter().map(|&i| batch[i].track).collect();
    tracks.sort();
    tracks.windows(2).any(|pair| pair[0] == pair[1])
}

fn album_kind(batch: &[SongRecord], members: &[usize], separator: &str) -> AlbumKind {
    let mut kind = AlbumKind::SingleArtist;
    for pair in members.windows(2) {
        let left = &batch[pair[0]].artist;
        let right = &batch[pair[1]].artist;
        if primary_artist(left, separator) != primary_artist(right, separator) {
            return AlbumKind::VariousArtists;
        }
        if left != right {
            kind = AlbumKind::Featured;
        }
    }
    kind
}

fn primary_artist<'a>(artist: &'a str, separator: &'a str) -> &'a str {
    split_artists(artist, separator).next().unwrap_or("")
}

pub fn split_artists<'a>(
    artist: &'a str,
    separator: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    let parts: Box<dyn Iterator<Item = &'a str> + 'a> = if separator.is_empty() {
        Box::new(std::iter::once(artist))
    } else {
        Box::new(artist.split(separator))
    };
    parts.map(str::trim).filter(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEP: &str = " / ";
    const VARIOUS: &str = "Various Artists";

    fn song(album: &str, artist: &str, track: u32) -> SongRecord {
        SongRecord {
            path: format!("/music/{}/{:02}.mp3", album, track),
            album: album.to_string(),
            artist: artist.to_string(),
            track,
            ..SongRecord::default()
        }
    }

    fn album_artists(batch: &[SongRecord]) -> Vec<&str> {
        batch.iter().map(|s| s.album_artist.as_str()).collect()
    }

    #[test]
    fn different_primary_artists_make_a_compilation() {
        let mut batch = vec![
            song("Greatest Hits", "Artist A", 1),
            song("Greatest Hits", "Artist B", 2),
        ];
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(album_artists(&batch), vec![VARIOUS, VARIOUS]);
    }

    #[test]
    fn featured_artists_keep_the_primary_artist() {
        let mut batch = vec![
            song("Collab", "Artist A", 1),
            song("Collab", "Artist A / Artist C", 2),
        ];
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(album_artists(&batch), vec!["Artist A", "Artist A"]);
    }

    #[test]
    fn overlapping_tracks_abort_grouping() {
        let mut batch = vec![song("X", "A", 1), song("X", "B", 1)];
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(album_artists(&batch), vec!["", ""]);
    }

    #[test]
    fn explicit_album_artist_protects_the_whole_album() {
        let mut batch = vec![
            song("Mix", "Artist A", 1),
            song("Mix", "Artist B", 2),
            song("Mix", "Artist C", 3),
        ];
        batch[1].album_artist = "DJ Someone".to_string();
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(album_artists(&batch), vec!["", "DJ Someone", ""]);
    }

    #[test]
    fn single_song_albums_are_untouched() {
        let mut batch = vec![song("Solo", "Artist A / Artist B", 1)];
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(album_artists(&batch), vec![""]);
    }

    #[test]
    fn identical_artists_leave_album_artist_empty() {
        let mut batch = vec![song("Same", "Artist A", 1), song("Same", "Artist A", 2)];
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(album_artists(&batch), vec!["", ""]);
    }

    #[test]
    fn empty_album_names_are_never_grouped() {
        let mut batch = vec![song("", "Artist A", 1), song("", "Artist B", 2)];
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(album_artists(&batch), vec!["", ""]);
    }

    #[test]
    fn various_artists_wins_over_featured() {
        let mut batch = vec![
            song("Both", "Artist A", 1),
            song("Both", "Artist A / Artist C", 2),
            song("Both", "Artist B", 3),
        ];
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(album_artists(&batch), vec![VARIOUS, VARIOUS, VARIOUS]);
    }

    #[test]
    fn albums_in_one_batch_are_classified_independently() {
        let mut batch = vec![
            song("One", "Artist A", 1),
            song("Two", "Artist X", 1),
            song("One", "Artist B", 2),
            song("Two", "Artist X / Artist Y", 2),
        ];
        classify(&mut batch, SEP, VARIOUS);
        assert_eq!(
            album_artists(&batch),
            vec![VARIOUS, "Artist X", VARIOUS, "Artist X"]
        );
        assert_eq!(batch[3].artist, "Artist X / Artist Y");
    }

    #[test]
    fn artist_names_are_trimmed_when_split() {
        let names: Vec<&str> = split_artists(" A /  / B ", "/").collect();
        assert_eq!(names, vec!["A", "B"]);
        let whole: Vec<&str> = split_artists("A / B", "").collect();
        assert_eq!(whole, vec!["A / B"]);
    }
}
