//! Flat ISO 9660 writer with Rock Ridge names, sized for cloud-init seeds.
//!
//! The NoCloud datasource looks for a volume labelled `CIDATA` holding
//! `meta-data`, `user-data` and `network-config`. Those names cannot be
//! expressed in ISO 9660 Level 1, so every file record carries a Rock Ridge
//! `NM` entry with the real name and a `PX` entry with POSIX mode bits.
//!
//! Only a single root directory is supported.
//!
//! Layout (2048-byte sectors):
//!
//! | Sector | Contents                                  |
//! |--------|-------------------------------------------|
//! | 0-15   | system area (zeros)                       |
//! | 16     | primary volume descriptor                 |
//! | 17     | descriptor set terminator                 |
//! | 18, 19 | path tables (little, big endian)          |
//! | 20     | root directory records                    |
//! | 21     | SUSP continuation area holding `ER`       |
//! | 22..   | file extents, each sector-aligned         |

const SECTOR_SIZE: usize = 2048;

const PVD_SECTOR: usize = 16;
const TERMINATOR_SECTOR: usize = 17;
const PATH_TABLE_L_SECTOR: usize = 18;
const PATH_TABLE_M_SECTOR: usize = 19;
const ROOT_DIR_SECTOR: usize = 20;
const CONTINUATION_SECTOR: usize = 21;
const FIRST_FILE_SECTOR: usize = 22;

/// Regular file, rw-r--r--.
const FILE_MODE: u32 = 0o100644;

/// A file placed in the root directory of the image.
pub struct IsoFile<'a> {
    /// POSIX name as the guest should see it.
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Where each file's extent lands.
struct Extent {
    sector: usize,
    len: usize,
}

/// Build a complete image. Output depends only on the inputs (no timestamps),
/// so identical inputs give identical bytes.
///
/// # Panics
///
/// Panics if `volume_id` is not ASCII or exceeds 32 characters, or if the
/// directory records do not fit in one sector.
pub fn build_iso(volume_id: &str, files: &[IsoFile<'_>]) -> Vec<u8> {
    assert!(
        volume_id.len() <= 32 && volume_id.is_ascii(),
        "volume_id must be ASCII, max 32 chars"
    );

    let mut extents = Vec::with_capacity(files.len());
    let mut next = FIRST_FILE_SECTOR;
    for f in files {
        extents.push(Extent {
            sector: next,
            len: f.data.len(),
        });
        next += sectors_for(f.data.len());
    }

    let mut iso = vec![0u8; next * SECTOR_SIZE];

    write_primary_descriptor(sector_mut(&mut iso, PVD_SECTOR), volume_id, next as u32);
    write_terminator(sector_mut(&mut iso, TERMINATOR_SECTOR));
    write_path_table(sector_mut(&mut iso, PATH_TABLE_L_SECTOR), u32::to_le_bytes, u16::to_le_bytes);
    write_path_table(sector_mut(&mut iso, PATH_TABLE_M_SECTOR), u32::to_be_bytes, u16::to_be_bytes);

    let er = susp_er();
    sector_mut(&mut iso, CONTINUATION_SECTOR)[..er.len()].copy_from_slice(&er);

    let records = root_directory_records(files, &extents, er.len());
    assert!(records.len() <= SECTOR_SIZE, "root directory exceeds one sector");
    sector_mut(&mut iso, ROOT_DIR_SECTOR)[..records.len()].copy_from_slice(&records);

    for (f, extent) in files.iter().zip(&extents) {
        let start = extent.sector * SECTOR_SIZE;
        iso[start..start + extent.len].copy_from_slice(f.data);
    }

    iso
}

fn sector_mut(iso: &mut [u8], sector: usize) -> &mut [u8] {
    &mut iso[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]
}

fn write_primary_descriptor(pvd: &mut [u8], volume_id: &str, total_sectors: u32) {
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;

    // System and volume identifiers are space padded.
    pvd[8..72].fill(b' ');
    pvd[40..40 + volume_id.len()].copy_from_slice(volume_id.as_bytes());

    put_u32_both(&mut pvd[80..88], total_sectors);
    put_u16_both(&mut pvd[120..124], 1); // volume set size
    put_u16_both(&mut pvd[124..128], 1); // volume sequence number
    put_u16_both(&mut pvd[128..132], SECTOR_SIZE as u16);
    put_u32_both(&mut pvd[132..140], 10); // one 10-byte path table entry
    pvd[140..144].copy_from_slice(&(PATH_TABLE_L_SECTOR as u32).to_le_bytes());
    pvd[148..152].copy_from_slice(&(PATH_TABLE_M_SECTOR as u32).to_be_bytes());

    let root = dir_record(ROOT_DIR_SECTOR as u32, SECTOR_SIZE as u32, b"\x00", true, &[]);
    pvd[156..156 + root.len()].copy_from_slice(&root);

    pvd[190..814].fill(b' ');
    pvd[881] = 1; // file structure version
}

fn write_terminator(vdst: &mut [u8]) {
    vdst[0] = 255;
    vdst[1..6].copy_from_slice(b"CD001");
    vdst[6] = 1;
}

/// Single entry path table pointing at the root directory. The two copies
/// differ only in byte order.
fn write_path_table(buf: &mut [u8], u32_bytes: fn(u32) -> [u8; 4], u16_bytes: fn(u16) -> [u8; 2]) {
    buf[0] = 1; // identifier length
    buf[2..6].copy_from_slice(&u32_bytes(ROOT_DIR_SECTOR as u32));
    buf[6..8].copy_from_slice(&u16_bytes(1)); // parent = self
}

/// `.` (carrying `SP` and a `CE` pointer to the `ER` entry), `..`, then one
/// record per file with `NM` + `PX`.
fn root_directory_records(files: &[IsoFile<'_>], extents: &[Extent], er_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECTOR_SIZE);
    let root = ROOT_DIR_SECTOR as u32;

    let mut dot_su = susp_sp();
    dot_su.extend_from_slice(&susp_ce(CONTINUATION_SECTOR as u32, 0, er_len as u32));
    out.extend_from_slice(&dir_record(root, SECTOR_SIZE as u32, b"\x00", true, &dot_su));
    out.extend_from_slice(&dir_record(root, SECTOR_SIZE as u32, b"\x01", true, &[]));

    for (f, extent) in files.iter().zip(extents) {
        let mut su = rrip_nm(f.name);
        su.extend_from_slice(&rrip_px(FILE_MODE, 1));
        let iso_name = to_level1_name(f.name);
        out.extend_from_slice(&dir_record(
            extent.sector as u32,
            extent.len as u32,
            iso_name.as_bytes(),
            false,
            &su,
        ));
    }
    out
}

/// Directory record: 33 fixed bytes, the identifier, a pad byte when the
/// identifier length is even, then the system use area.
fn dir_record(extent: u32, size: u32, name: &[u8], is_dir: bool, su: &[u8]) -> Vec<u8> {
    let pad = usize::from(name.len().is_multiple_of(2));
    let len = 33 + name.len() + pad + su.len();
    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    put_u32_both(&mut rec[2..10], extent);
    put_u32_both(&mut rec[10..18], size);
    rec[25] = if is_dir { 0x02 } else { 0x00 };
    put_u16_both(&mut rec[28..32], 1);
    rec[32] = name.len() as u8;
    rec[33..33 + name.len()].copy_from_slice(name);
    let su_start = 33 + name.len() + pad;
    rec[su_start..].copy_from_slice(su);
    rec
}

/// SUSP header: two signature bytes, total length, version 1.
fn susp_entry(sig: &[u8; 2], body: &[u8]) -> Vec<u8> {
    let mut e = Vec::with_capacity(4 + body.len());
    e.extend_from_slice(sig);
    e.push((4 + body.len()) as u8);
    e.push(1);
    e.extend_from_slice(body);
    e
}

fn susp_sp() -> Vec<u8> {
    susp_entry(b"SP", &[0xBE, 0xEF, 0])
}

fn susp_ce(block: u32, offset: u32, length: u32) -> Vec<u8> {
    let mut body = [0u8; 24];
    put_u32_both(&mut body[0..8], block);
    put_u32_both(&mut body[8..16], offset);
    put_u32_both(&mut body[16..24], length);
    susp_entry(b"CE", &body)
}

/// Identifies the Rock Ridge extension (`RRIP_1991A`).
fn susp_er() -> Vec<u8> {
    let id: &[u8] = b"RRIP_1991A";
    let desc: &[u8] =
        b"THE ROCK RIDGE INTERCHANGE PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS";
    let src: &[u8] = b"PLEASE CONTACT DISC PUBLISHER FOR SPECIFICATION SOURCE.  SEE PUBLISHER IDENTIFIER IN PRIMARY VOLUME DESCRIPTOR FOR CONTACT INFORMATION.";
    let mut body = vec![id.len() as u8, desc.len() as u8, src.len() as u8, 1];
    body.extend_from_slice(id);
    body.extend_from_slice(desc);
    body.extend_from_slice(src);
    susp_entry(b"ER", &body)
}

fn rrip_nm(name: &str) -> Vec<u8> {
    let mut body = vec![0u8]; // flags: complete name
    body.extend_from_slice(name.as_bytes());
    susp_entry(b"NM", &body)
}

/// Mode and link count; uid, gid and serial stay zero.
fn rrip_px(mode: u32, nlinks: u32) -> Vec<u8> {
    let mut body = [0u8; 40];
    put_u32_both(&mut body[0..8], mode);
    put_u32_both(&mut body[8..16], nlinks);
    susp_entry(b"PX", &body)
}

/// 8.3 uppercase name with `;1` version suffix, for readers without Rock Ridge.
fn to_level1_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            c @ ('A'..='Z' | '0'..='9' | '_' | '.') => c,
            _ => '_',
        })
        .collect();

    match sanitized.split_once('.') {
        Some((base, ext)) => {
            let base = &base[..base.len().min(8)];
            let ext = ext.split('.').next().unwrap_or("");
            format!("{base}.{};1", &ext[..ext.len().min(3)])
        }
        None => format!("{};1", &sanitized[..sanitized.len().min(8)]),
    }
}

/// Empty files still occupy one sector.
fn sectors_for(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE).max(1)
}

/// ISO 9660 "both-endian": little-endian copy followed by big-endian copy.
fn put_u32_both(buf: &mut [u8], val: u32) {
    buf[0..4].copy_from_slice(&val.to_le_bytes());
    buf[4..8].copy_from_slice(&val.to_be_bytes());
}

fn put_u16_both(buf: &mut [u8], val: u16) {
    buf[0..2].copy_from_slice(&val.to_le_bytes());
    buf[2..4].copy_from_slice(&val.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_iso() -> Vec<u8> {
        build_iso(
            "CIDATA",
            &[
                IsoFile {
                    name: "meta-data",
                    data: b"instance-id: t1\n",
                },
                IsoFile {
                    name: "user-data",
                    data: b"#cloud-config\n",
                },
                IsoFile {
                    name: "network-config",
                    data: b"version: 2\n",
                },
            ],
        )
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn descriptor_carries_magic_and_label() {
        let iso = seed_iso();
        assert_eq!(&iso[0x8001..0x8006], b"CD001");
        let label = &iso[PVD_SECTOR * SECTOR_SIZE + 40..PVD_SECTOR * SECTOR_SIZE + 46];
        assert_eq!(label, b"CIDATA");
        assert_eq!(iso[PVD_SECTOR * SECTOR_SIZE + 46], b' ');
    }

    #[test]
    fn terminator_follows_descriptor() {
        let iso = seed_iso();
        let t = TERMINATOR_SECTOR * SECTOR_SIZE;
        assert_eq!(iso[t], 255);
        assert_eq!(&iso[t + 1..t + 6], b"CD001");
    }

    #[test]
    fn image_is_sector_aligned_and_holds_contents() {
        let iso = seed_iso();
        assert_eq!(iso.len() % SECTOR_SIZE, 0);
        assert!(contains(&iso, b"instance-id: t1\n"));
        assert!(contains(&iso, b"#cloud-config\n"));
        assert!(contains(&iso, b"version: 2\n"));
    }

    #[test]
    fn rock_ridge_entries_present() {
        let iso = seed_iso();
        assert!(contains(&iso, b"meta-data"));
        assert!(contains(&iso, b"network-config"));
        assert!(contains(&iso, &[b'S', b'P', 7, 1, 0xBE, 0xEF]));
        assert!(contains(&iso, b"RRIP_1991A"));
    }

    #[test]
    fn root_directory_starts_with_dot() {
        let iso = seed_iso();
        let root = ROOT_DIR_SECTOR * SECTOR_SIZE;
        assert_eq!(iso[root + 32], 1);
        assert_eq!(iso[root + 33], 0x00);
        assert_eq!(iso[root + 25] & 0x02, 0x02);
    }

    #[test]
    fn path_tables_point_to_root() {
        let iso = seed_iso();
        let l = &iso[PATH_TABLE_L_SECTOR * SECTOR_SIZE..];
        assert_eq!(u32::from_le_bytes([l[2], l[3], l[4], l[5]]), ROOT_DIR_SECTOR as u32);
        let m = &iso[PATH_TABLE_M_SECTOR * SECTOR_SIZE..];
        assert_eq!(u32::from_be_bytes([m[2], m[3], m[4], m[5]]), ROOT_DIR_SECTOR as u32);
    }

    #[test]
    fn level1_names() {
        assert_eq!(to_level1_name("meta-data"), "META_DAT;1");
        assert_eq!(to_level1_name("network-config"), "NETWORK_;1");
        assert_eq!(to_level1_name("README"), "README;1");
        assert_eq!(to_level1_name("file.txt"), "FILE.TXT;1");
        assert_eq!(to_level1_name("longfilename.extension"), "LONGFILE.EXT;1");
    }

    #[test]
    fn large_file_spans_sectors() {
        let big = vec![0xABu8; 5000];
        let iso = build_iso("TEST", &[IsoFile { name: "big.bin", data: &big }]);
        assert_eq!(iso.len(), (FIRST_FILE_SECTOR + 3) * SECTOR_SIZE);
        let start = FIRST_FILE_SECTOR * SECTOR_SIZE;
        assert_eq!(&iso[start..start + 5000], big.as_slice());
    }

    #[test]
    fn empty_file_takes_one_sector() {
        let iso = build_iso("TEST", &[IsoFile { name: "empty", data: b"" }]);
        assert_eq!(iso.len(), (FIRST_FILE_SECTOR + 1) * SECTOR_SIZE);
    }

    #[test]
    fn output_is_deterministic() {
        assert_eq!(seed_iso(), seed_iso());
    }
}
