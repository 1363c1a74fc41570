//! File-list XML generation: the full list (plain and bz2-compressed) and
//! on-demand partial lists for a virtual sub-path.

use std::io::Write;

use bzip2::write::BzEncoder;
use bzip2::Compression;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::hash::build_tth;
use crate::ids::Cid;
use crate::share::dir::Directory;
use crate::TthValue;

/// Below this depth, partial lists recurse fully; at or beyond it, a
/// directory with more children than the per-level cap is flattened to an
/// `Incomplete="1"` stub "flattening descendants below a depth
/// of 2 with <=(16,4) items/level".
const PARTIAL_FULL_DEPTH: usize = 2;
const PARTIAL_MAX_FILES_PER_LEVEL: usize = 16;
const PARTIAL_MAX_DIRS_PER_LEVEL: usize = 4;

fn write_file_listing_root(
    writer: &mut Writer<&mut Vec<u8>>,
    cid: &Cid,
    base: &str,
    generator: &str,
) -> quick_xml::Result<()> {
    writer.write_event(Event::Decl(quick_xml::events::BytesDecl::new(
        b"1.0",
        Some(b"utf-8"),
        None,
    )))?;

    let mut root = BytesStart::borrowed_name(b"FileListing");
    root.push_attribute(("Version", "1"));
    let cid_str = cid.to_base32();
    root.push_attribute(("CID", cid_str.as_str()));
    root.push_attribute(("Base", base));
    root.push_attribute(("Generator", generator));
    writer.write_event(Event::Start(root))?;
    Ok(())
}

fn write_dir(
    writer: &mut Writer<&mut Vec<u8>>,
    dir: &Directory,
    depth: usize,
    flatten: bool,
) -> quick_xml::Result<()> {
    let mut start = BytesStart::borrowed_name(b"Directory");
    start.push_attribute(("Name", dir.name.as_str()));

    let should_flatten = flatten
        && depth >= PARTIAL_FULL_DEPTH
        && (dir.files.len() > PARTIAL_MAX_FILES_PER_LEVEL
            || dir.dirs.len() > PARTIAL_MAX_DIRS_PER_LEVEL);

    if should_flatten {
        start.push_attribute(("Incomplete", "1"));
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    if dir.dirs.is_empty() && dir.files.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for file in &dir.files {
        let mut f = BytesStart::borrowed_name(b"File");
        f.push_attribute(("Name", file.name.as_str()));
        let size_str = file.size.to_string();
        f.push_attribute(("Size", size_str.as_str()));
        if let Some(tth) = file.tth {
            let tth_str = tth.to_base32();
            f.push_attribute(("TTH", tth_str.as_str()));
        }
        writer.write_event(Event::Empty(f))?;
    }
    for child in dir.dirs.values() {
        write_dir(writer, child, depth + 1, flatten)?;
    }
    writer.write_event(Event::End(BytesEnd::borrowed(b"Directory")))?;
    Ok(())
}

fn write_file_listing_end(writer: &mut Writer<&mut Vec<u8>>) -> quick_xml::Result<()> {
    writer.write_event(Event::End(BytesEnd::borrowed(b"FileListing")))
}

/// Generates the complete, uncompressed file list rooted at every shared
/// top-level directory.
pub fn generate_full_xml(
    roots: &[Directory],
    cid: &Cid,
    generator: &str,
) -> quick_xml::Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = Writer::new(&mut buf);
        write_file_listing_root(&mut writer, cid, "/", generator)?;
        for root in roots {
            write_dir(&mut writer, root, 0, false)?;
        }
        write_file_listing_end(&mut writer)?;
    }
    Ok(buf)
}

/// Bz2-compresses an already-generated list body "also served
/// bz2-compressed as `files.xml.bz2`".
pub fn compress_bz2(xml: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(xml)?;
    encoder.finish()
}

/// Generates a partial list for the sub-path addressed by `dir` (already
/// resolved by the caller), flattening deep/wide descendants per spec §4.2.
pub fn generate_partial_xml(
    dir: &Directory,
    base: &str,
    cid: &Cid,
    generator: &str,
) -> quick_xml::Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = Writer::new(&mut buf);
        write_file_listing_root(&mut writer, cid, base, generator)?;
        for file in &dir.files {
            let mut f = BytesStart::borrowed_name(b"File");
            f.push_attribute(("Name", file.name.as_str()));
            let size_str = file.size.to_string();
            f.push_attribute(("Size", size_str.as_str()));
            if let Some(tth) = file.tth {
                let tth_str = tth.to_base32();
                f.push_attribute(("TTH", tth_str.as_str()));
            }
            writer.write_event(Event::Empty(f))?;
        }
        for child in dir.dirs.values() {
            write_dir(&mut writer, child, 0, true)?;
        }
        write_file_listing_end(&mut writer)?;
    }
    Ok(buf)
}

/// Computes the TTH of a generated list body "Both files
/// receive a TTH computed while writing".
pub fn tth_of_list(xml: &[u8]) -> TthValue {
    build_tth(xml).tth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::dir::File;
    use std::path::PathBuf;

    fn sample() -> Vec<Directory> {
        let mut root = Directory::new("share");
        root.insert_file(File {
            name: "a.txt".into(),
            size: 5,
            tth: Some(TthValue([9; 24])),
            real_path: PathBuf::from("/r/a.txt"),
        });
        vec![root]
    }

    #[test]
    fn full_xml_contains_file_and_root_element() {
        let cid = Cid([1; 24]);
        let xml = generate_full_xml(&sample(), &cid, "dctp-core").unwrap();
        let s = String::from_utf8(xml).unwrap();
        assert!(s.contains("<FileListing"));
        assert!(s.contains("a.txt"));
        assert!(s.contains("</FileListing>"));
    }

    #[test]
    fn bz2_roundtrips_through_a_decoder() {
        let xml = b"<FileListing></FileListing>".to_vec();
        let compressed = compress_bz2(&xml).unwrap();
        let mut decoder = bzip2::read::BzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
        assert_eq!(out, xml);
    }

    #[test]
    fn list_tth_is_deterministic() {
        let xml = b"<FileListing></FileListing>";
        assert_eq!(tth_of_list(xml), tth_of_list(xml));
    }
}
