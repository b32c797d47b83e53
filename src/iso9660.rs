//! Tiny ISO 9660 writer for cloud-init seed volumes.
//!
//! Only what the NoCloud datasource needs: a flat root directory of small
//! files on a volume labelled `CIDATA`. Rock Ridge NM/PX entries carry the
//! real lowercase filenames; the mangled Level 1 names exist only to keep
//! strict readers happy. Produced entirely in-process, so no external ISO
//! tooling is required on the host.

use crate::error::CloudInitError;

const SECTOR: usize = 2048;

const PVD_SECTOR: usize = 16;
const TERMINATOR_SECTOR: usize = 17;
const PATH_TABLE_L_SECTOR: usize = 18;
const PATH_TABLE_M_SECTOR: usize = 19;
const ROOT_DIR_SECTOR: usize = 20;
const FIRST_FILE_SECTOR: usize = 21;

/// One file to place in the volume's root directory.
pub struct SeedFile<'a> {
    pub name: &'a str,
    pub contents: &'a [u8],
}

/// Build a complete ISO image in memory.
pub fn build(volume_label: &str, files: &[SeedFile<'_>]) -> Result<Vec<u8>, CloudInitError> {
    debug_assert!(volume_label.is_ascii() && volume_label.len() <= 32);

    // Lay out file extents first; each starts on a sector boundary.
    let mut extents = Vec::with_capacity(files.len());
    let mut next = FIRST_FILE_SECTOR;
    for f in files {
        extents.push(next as u32);
        next += sectors(f.contents.len());
    }
    let total_sectors = next;

    let root = root_directory(files, &extents)?;

    let mut image = vec![0u8; total_sectors * SECTOR];
    write_volume_descriptor(sector_mut(&mut image, PVD_SECTOR), volume_label, total_sectors);
    write_terminator(sector_mut(&mut image, TERMINATOR_SECTOR));
    write_path_table(sector_mut(&mut image, PATH_TABLE_L_SECTOR), false);
    write_path_table(sector_mut(&mut image, PATH_TABLE_M_SECTOR), true);
    sector_mut(&mut image, ROOT_DIR_SECTOR)[..root.len()].copy_from_slice(&root);
    for (f, extent) in files.iter().zip(&extents) {
        let start = *extent as usize * SECTOR;
        image[start..start + f.contents.len()].copy_from_slice(f.contents);
    }

    Ok(image)
}

fn sector_mut(image: &mut [u8], index: usize) -> &mut [u8] {
    &mut image[index * SECTOR..(index + 1) * SECTOR]
}

fn sectors(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR).max(1)
}

// Multi-byte numbers are stored twice, little-endian then big-endian, so
// readers on either architecture avoid byte swaps.
fn both_u16(value: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&value.to_le_bytes());
    out[2..].copy_from_slice(&value.to_be_bytes());
    out
}

fn both_u32(value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&value.to_le_bytes());
    out[4..].copy_from_slice(&value.to_be_bytes());
    out
}

fn write_volume_descriptor(pvd: &mut [u8], label: &str, total_sectors: usize) {
    pvd[0] = 1; // primary volume descriptor
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;
    pvd[8..40].fill(b' ');
    pvd[40..72].fill(b' ');
    pvd[40..40 + label.len()].copy_from_slice(label.as_bytes());
    pvd[80..88].copy_from_slice(&both_u32(total_sectors as u32));
    pvd[120..124].copy_from_slice(&both_u16(1)); // volume set size
    pvd[124..128].copy_from_slice(&both_u16(1)); // sequence number
    pvd[128..132].copy_from_slice(&both_u16(SECTOR as u16));
    pvd[132..140].copy_from_slice(&both_u32(10)); // path table bytes
    pvd[140..144].copy_from_slice(&(PATH_TABLE_L_SECTOR as u32).to_le_bytes());
    pvd[148..152].copy_from_slice(&(PATH_TABLE_M_SECTOR as u32).to_be_bytes());

    // Root directory record embedded at offset 156.
    let root = directory_record(ROOT_DIR_SECTOR as u32, SECTOR as u32, &[0x00], true, &[]);
    pvd[156..156 + root.len()].copy_from_slice(&root);

    pvd[190..814].fill(b' '); // publisher/preparer/application ids
    pvd[881] = 1; // file structure version
}

fn write_terminator(vdst: &mut [u8]) {
    vdst[0] = 255;
    vdst[1..6].copy_from_slice(b"CD001");
    vdst[6] = 1;
}

/// Single 10-byte entry: the root directory referencing itself.
fn write_path_table(buf: &mut [u8], big_endian: bool) {
    buf[0] = 1; // identifier length
    if big_endian {
        buf[2..6].copy_from_slice(&(ROOT_DIR_SECTOR as u32).to_be_bytes());
        buf[6..8].copy_from_slice(&1u16.to_be_bytes());
    } else {
        buf[2..6].copy_from_slice(&(ROOT_DIR_SECTOR as u32).to_le_bytes());
        buf[6..8].copy_from_slice(&1u16.to_le_bytes());
    }
    buf[8] = 0x00; // root identifier
}

fn root_directory(files: &[SeedFile<'_>], extents: &[u32]) -> Result<Vec<u8>, CloudInitError> {
    let mut dir = Vec::with_capacity(SECTOR);

    // "." carries the SUSP presence marker; ".." points back at the root.
    let sp = [b'S', b'P', 7, 1, 0xBE, 0xEF, 0];
    dir.extend(directory_record(
        ROOT_DIR_SECTOR as u32,
        SECTOR as u32,
        &[0x00],
        true,
        &sp,
    ));
    dir.extend(directory_record(
        ROOT_DIR_SECTOR as u32,
        SECTOR as u32,
        &[0x01],
        true,
        &[],
    ));

    for (f, extent) in files.iter().zip(extents) {
        let mut susp = rock_ridge_name(f.name);
        susp.extend(rock_ridge_attrs());
        dir.extend(directory_record(
            *extent,
            f.contents.len() as u32,
            level1_name(f.name).as_bytes(),
            false,
            &susp,
        ));
    }

    if dir.len() > SECTOR {
        return Err(CloudInitError::ContentTooLarge(format!(
            "{} root directory entries need {} bytes",
            files.len() + 2,
            dir.len()
        )));
    }
    Ok(dir)
}

/// Variable-length directory record with an optional system-use payload.
fn directory_record(extent: u32, size: u32, ident: &[u8], is_dir: bool, susp: &[u8]) -> Vec<u8> {
    // The system-use area must start on an even offset; 33 + even ident
    // lengths need one pad byte.
    let pad = usize::from(ident.len() % 2 == 0);
    let len = 33 + ident.len() + pad + susp.len();

    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    rec[2..10].copy_from_slice(&both_u32(extent));
    rec[10..18].copy_from_slice(&both_u32(size));
    rec[25] = if is_dir { 0x02 } else { 0x00 };
    rec[28..32].copy_from_slice(&both_u16(1));
    rec[32] = ident.len() as u8;
    rec[33..33 + ident.len()].copy_from_slice(ident);
    rec[33 + ident.len() + pad..].copy_from_slice(susp);
    rec
}

/// Rock Ridge NM entry: the POSIX filename Linux actually shows.
fn rock_ridge_name(name: &str) -> Vec<u8> {
    let mut entry = vec![b'N', b'M', (5 + name.len()) as u8, 1, 0];
    entry.extend_from_slice(name.as_bytes());
    entry
}

/// Rock Ridge PX entry: mode 0644 regular file, one link.
fn rock_ridge_attrs() -> Vec<u8> {
    let mut entry = vec![b'P', b'X', 44, 1];
    entry.extend(both_u32(0o100644));
    entry.extend(both_u32(1));
    entry.extend([0u8; 24]); // uid, gid, serial
    entry
}

/// Mangle into the restricted Level 1 character set. Seed filenames have no
/// extensions, so no 8.3 split is needed; readers that care use the NM
/// entry anyway.
fn level1_name(name: &str) -> String {
    let mut mangled: String = name
        .chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c.is_ascii_alphanumeric() { c } else { '_' }
        })
        .take(8)
        .collect();
    mangled.push_str(";1");
    mangled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Vec<u8> {
        build(
            "CIDATA",
            &[
                SeedFile {
                    name: "meta-data",
                    contents: b"instance-id: vm-test\n",
                },
                SeedFile {
                    name: "user-data",
                    contents: b"#cloud-config\n",
                },
                SeedFile {
                    name: "network-config",
                    contents: b"version: 2\n",
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn descriptor_magic_and_label() {
        let iso = seed();
        assert_eq!(&iso[PVD_SECTOR * SECTOR + 1..PVD_SECTOR * SECTOR + 6], b"CD001");
        assert_eq!(
            &iso[PVD_SECTOR * SECTOR + 40..PVD_SECTOR * SECTOR + 46],
            b"CIDATA"
        );
        assert_eq!(iso[TERMINATOR_SECTOR * SECTOR], 255);
    }

    #[test]
    fn image_is_sector_aligned_and_sized_by_descriptor() {
        let iso = seed();
        assert_eq!(iso.len() % SECTOR, 0);
        let declared = u32::from_le_bytes(
            iso[PVD_SECTOR * SECTOR + 80..PVD_SECTOR * SECTOR + 84]
                .try_into()
                .unwrap(),
        );
        assert_eq!(declared as usize * SECTOR, iso.len());
    }

    #[test]
    fn file_contents_start_on_sector_boundaries() {
        let iso = seed();
        assert_eq!(
            &iso[FIRST_FILE_SECTOR * SECTOR..FIRST_FILE_SECTOR * SECTOR + 21],
            b"instance-id: vm-test\n"
        );
        assert_eq!(
            &iso[(FIRST_FILE_SECTOR + 1) * SECTOR..(FIRST_FILE_SECTOR + 1) * SECTOR + 14],
            b"#cloud-config\n"
        );
    }

    #[test]
    fn rock_ridge_names_present() {
        let iso = seed();
        for name in ["meta-data", "user-data", "network-config"] {
            assert!(
                iso.windows(name.len()).any(|w| w == name.as_bytes()),
                "missing NM entry for {name}"
            );
        }
        let sp = [b'S', b'P', 7, 1, 0xBE, 0xEF];
        assert!(iso.windows(sp.len()).any(|w| w == sp));
    }

    #[test]
    fn multi_sector_file_round_trips() {
        let big = vec![0x5Au8; 3 * SECTOR + 17];
        let iso = build(
            "TEST",
            &[SeedFile {
                name: "payload",
                contents: &big,
            }],
        )
        .unwrap();
        let start = FIRST_FILE_SECTOR * SECTOR;
        assert_eq!(&iso[start..start + big.len()], big.as_slice());
        assert_eq!(iso.len(), (FIRST_FILE_SECTOR + 4) * SECTOR);
    }

    #[test]
    fn too_many_entries_is_an_error() {
        let contents = b"x";
        let names: Vec<String> = (0..60).map(|i| format!("file-number-{i:02}")).collect();
        let files: Vec<SeedFile<'_>> = names
            .iter()
            .map(|n| SeedFile {
                name: n,
                contents,
            })
            .collect();
        assert!(matches!(
            build("TEST", &files),
            Err(CloudInitError::ContentTooLarge(_))
        ));
    }

    #[test]
    fn level1_mangling() {
        assert_eq!(level1_name("meta-data"), "META_DAT;1");
        assert_eq!(level1_name("network-config"), "NETWORK_;1");
        assert_eq!(level1_name("a"), "A;1");
    }
}
