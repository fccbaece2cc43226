// Decoder for the Pilot floppy volume structures: the sector-nine volume
// descriptor, the file list it points at, and the leader page kept for each
// file. Sector bytes on the host image are word-swapped, so every sector is
// swapped while it is read into the buffer.
//
// A wrong seal or version means the image is not a Pilot floppy; decoding
// stops fatally, as the agent has no way to proceed.

use crate::bytebuffer::ByteBuffer;
use crate::diskfile::DiskFile;
use crate::pilot::*;
use std::fmt;
use std::sync::Arc;

pub struct FloppyDisk {
    disk: Arc<DiskFile>,
}

impl FloppyDisk {
    pub fn new(disk: Arc<DiskFile>) -> FloppyDisk {
        FloppyDisk { disk }
    }

    // Sectors are numbered from one. Each word is byteswapped into the
    // buffer, which then serves the corrected bytes big-endian.
    pub fn read_sector(&self, sector: u32, count: u32) -> ByteBuffer {
        if sector == 0 {
            panic!("sector numbers start at one");
        }
        let mut bb = ByteBuffer::new(count * BYTES_PER_PAGE);
        let mut buffer = vec![0u16; PAGE_SIZE as usize];
        for i in 0..count {
            self.disk.read_page(sector - 1 + i, &mut buffer);
            for &word in &buffer {
                // The image's little-endian word view presents each swapped
                // byte pair low byte first; writing it back out big-endian
                // is exactly the per-sector swap.
                bb.write16(u16::from_le_bytes(word.to_ne_bytes()));
            }
        }
        bb.rewind();
        bb
    }
}

// FloppyFormat.mesa sector nine
pub struct SectorNine {
    pub seal: u16,
    pub version: u16,
    pub cylinders: u16,
    pub tracks_per_cylinder: u16,
    pub sectors_per_track: u16,
    pub file_list: u16,
    pub file_list_id: u32,
    pub file_list_size: u16,
    pub root_file: u32,
    pub alternate_microcode: u16,
    pub pilot_microcode: u16,
    pub diagnostic_microcode: u16,
    pub germ: u16,
    pub pilot_boot_file: u16,
    pub first_alternate_sector: u16,
    pub count_bad_sectors: u16,
    pub next_unused_file_id: u32,
    pub changing: u16,
    pub label_size: u16,
    pub label: String,
}

impl SectorNine {
    pub const SEAL: u16 = 0o141414;
    pub const VERSION: u16 = 1;

    pub fn read(floppy: &FloppyDisk) -> SectorNine {
        let mut bb = floppy.read_sector(9, 1);
        let seal = bb.read16();
        let version = bb.read16();
        if seal != Self::SEAL {
            panic!("sector nine seal = {:06o}  SEAL = {:06o}", seal, Self::SEAL);
        }
        if version != Self::VERSION {
            panic!("sector nine version = {}  VERSION = {}", version, Self::VERSION);
        }
        let cylinders = bb.read16();
        let tracks_per_cylinder = bb.read16();
        let sectors_per_track = bb.read16();
        if tracks_per_cylinder != FLOPPY_NUMBER_OF_HEADS {
            panic!("tracksPerCylinder = {}", tracks_per_cylinder);
        }
        if sectors_per_track != FLOPPY_SECTORS_PER_TRACK {
            panic!("sectorsPerTrack = {}", sectors_per_track);
        }
        let file_list = bb.read16();
        let file_list_id = bb.read32();
        let file_list_size = bb.read16();
        let root_file = bb.read32();
        let alternate_microcode = bb.read16();
        let pilot_microcode = bb.read16();
        let diagnostic_microcode = bb.read16();
        let germ = bb.read16();
        let pilot_boot_file = bb.read16();
        let first_alternate_sector = bb.read16();
        let count_bad_sectors = bb.read16();
        let next_unused_file_id = bb.read32();
        let changing = bb.read16();
        let label_size = bb.read16();
        let mut label = String::new();
        for _ in 0..label_size {
            label.push(bb.read8() as char);
        }
        SectorNine {
            seal,
            version,
            cylinders,
            tracks_per_cylinder,
            sectors_per_track,
            file_list,
            file_list_id,
            file_list_size,
            root_file,
            alternate_microcode,
            pilot_microcode,
            diagnostic_microcode,
            germ,
            pilot_boot_file,
            first_alternate_sector,
            count_bad_sectors,
            next_unused_file_id,
            changing,
            label_size,
            label,
        }
    }
}

impl fmt::Display for SectorNine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== SectorNine ====")?;
        writeln!(f, "cylinders            {:6}", self.cylinders)?;
        writeln!(f, "tracksPerCylinder    {:6}", self.tracks_per_cylinder)?;
        writeln!(f, "sectorsPerTrack      {:6}", self.sectors_per_track)?;
        writeln!(f, "fileList             {:6}", self.file_list)?;
        writeln!(f, "fileListSize         {:6}", self.file_list_size)?;
        writeln!(f, "germ                 {:6}", self.germ)?;
        writeln!(f, "pilotBootFile        {:6}", self.pilot_boot_file)?;
        write!(f, "label                    \"{}\"", self.label)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileEntry {
    pub file: u32,
    pub file_type: u16,
    pub location: u16,
    pub size: u16,
}

pub struct FileList {
    pub seal: u16,
    pub version: u16,
    pub count: u16,
    pub max_entries: u16,
    pub files: Vec<FileEntry>,
}

impl FileList {
    pub const SEAL: u16 = 0o131313;
    pub const VERSION: u16 = 1;

    pub fn read(floppy: &FloppyDisk, file_list: u32, file_list_size: u32) -> FileList {
        let mut bb = floppy.read_sector(file_list, file_list_size);
        let seal = bb.read16();
        let version = bb.read16();
        if seal != Self::SEAL {
            panic!("file list seal = {:06o}  SEAL = {:06o}", seal, Self::SEAL);
        }
        if version != Self::VERSION {
            panic!("file list version = {}  VERSION = {}", version, Self::VERSION);
        }
        let count = bb.read16();
        let max_entries = bb.read16();
        let mut files = Vec::with_capacity(count as usize);
        for _ in 0..count {
            files.push(FileEntry {
                file: bb.read32(),
                file_type: bb.read16(),
                location: bb.read16(),
                size: bb.read16(),
            });
        }
        FileList { seal, version, count, max_entries, files }
    }
}

impl fmt::Display for FileList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== FileList ====")?;
        writeln!(f, "count       {:6}", self.count)?;
        writeln!(f, "maxEntries  {:6}", self.max_entries)?;
        for entry in &self.files {
            writeln!(
                f,
                "  file {:8}  type {:5}  location {:5}  size {:5}",
                entry.file, entry.file_type, entry.location, entry.size
            )?;
        }
        Ok(())
    }
}

// AccessFloppy.mesa leader page
pub struct FloppyLeaderPage {
    pub seal: u16,
    pub version: u16,
    pub file_type: u16,
    pub create_date: u32,
    pub last_written_date: u32,
    pub size: u32,
    pub offset: u32,
    pub total_size: u32,
    pub total_size_in_bytes: u32,
    pub name: String,
    pub client_data: Vec<u16>,
    pub contents: Vec<u8>,
}

impl FloppyLeaderPage {
    pub const SEAL: u16 = 0o125252;
    pub const VERSION: u16 = 1;

    pub fn read(floppy: &FloppyDisk, entry: &FileEntry) -> FloppyLeaderPage {
        let mut bb = floppy.read_sector(entry.location as u32, entry.size as u32);

        // identity attributes
        let seal = bb.read16();
        let version = bb.read16();
        let file_type = bb.read16();
        if seal != Self::SEAL {
            panic!("leader page seal = {:06o}  SEAL = {:06o}", seal, Self::SEAL);
        }
        if version != Self::VERSION {
            panic!("leader page version = {}  VERSION = {}", version, Self::VERSION);
        }

        // activity attributes
        let create_date = bb.read32();
        let last_written_date = bb.read32();
        // file attributes
        let size = bb.read32();
        let offset = bb.read32();
        let total_size = bb.read32();
        let total_size_in_bytes = bb.read32();
        // name attributes
        let name_length = bb.read16();
        let name_max_length = bb.read16();
        let mut name = String::new();
        for i in 0..name_max_length {
            let c = bb.read8();
            if i < name_length {
                name.push(c as char);
            }
        }
        // client attributes
        let client_data_length = bb.read16();
        let client_data_max_length = bb.read16();
        let mut client_data = Vec::new();
        for i in 0..client_data_max_length {
            let word = bb.read16();
            if i < client_data_length {
                client_data.push(word);
            }
        }

        // contents begin on the page after the leader
        if bb.position() != BYTES_PER_PAGE {
            panic!("leader page overran its page  position = {}", bb.position());
        }
        let mut contents = Vec::with_capacity(total_size_in_bytes as usize);
        for _ in 0..total_size_in_bytes {
            contents.push(bb.read8());
        }

        FloppyLeaderPage {
            seal,
            version,
            file_type,
            create_date,
            last_written_date,
            size,
            offset,
            total_size,
            total_size_in_bytes,
            name,
            client_data,
            contents,
        }
    }
}

impl fmt::Display for FloppyLeaderPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== LeaderPage ====")?;
        writeln!(f, "type             {:6}", self.file_type)?;
        writeln!(f, "size             {:6}", self.size)?;
        writeln!(f, "totalSize        {:6}", self.total_size)?;
        writeln!(f, "totalSizeInBytes {:6}", self.total_size_in_bytes)?;
        writeln!(f, "createDate       {:6}", to_unix_time(self.create_date))?;
        writeln!(f, "name                 \"{}\"", self.name)?;
        write!(f, "contents         {:6}", self.contents.len())
    }
}

// Everything on the floppy that carries a leader page, in catalog order.
pub fn list_floppy(disk: Arc<DiskFile>) -> Vec<FloppyLeaderPage> {
    let floppy = FloppyDisk::new(disk);
    let nine = SectorNine::read(&floppy);
    let list = FileList::read(&floppy, nine.file_list as u32, nine.file_list_size as u32);
    list.files
        .iter()
        .filter(|entry| entry.file_type == T_FLOPPY_LEADER_PAGE)
        .map(|entry| FloppyLeaderPage::read(&floppy, entry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Build a miniature floppy image: sector 9 volume descriptor, file list
    // at sector 10, one file with a leader page at sector 11.
    fn build_image() -> Vec<u8> {
        let pages = 80 * 2 * 15; // nominal 80-cylinder floppy
        let mut image = vec![0u8; pages * BYTES_PER_PAGE as usize];

        let mut write_words = |sector: usize, words: &[u16]| {
            let base = (sector - 1) * BYTES_PER_PAGE as usize;
            for (i, &w) in words.iter().enumerate() {
                // image stores each word byte-swapped
                let swapped = w.swap_bytes();
                image[base + i * 2] = (swapped >> 8) as u8;
                image[base + i * 2 + 1] = swapped as u8;
            }
        };

        // sector nine
        let nine = [
            SectorNine::SEAL,
            SectorNine::VERSION,
            80, // cylinders
            FLOPPY_NUMBER_OF_HEADS,
            FLOPPY_SECTORS_PER_TRACK,
            10, // fileList sector
            0, 7, // fileListID
            1, // fileListSize
            0, 0, // rootFile
            0, 0, 0, // microcode
            0, // germ
            0, // pilotBootFile
            0, 0, // alternates
            0, 8, // nextUnusedFileID
            0, // changing
            2, // labelSize
            0x4142, // "AB"
        ];
        write_words(9, &nine);

        // file list: one leader-page file at sector 11, size 2 pages
        let list = [
            FileList::SEAL,
            FileList::VERSION,
            1, // count
            8, // maxEntries
            0, 5, // file id
            T_FLOPPY_LEADER_PAGE,
            11, // location
            2,  // size
        ];
        write_words(10, &list);

        // Leader page at sector 11. Name and client-data capacities are
        // sized so the attributes fill the page exactly, as on real media.
        let name_max = 100u16;
        let client_max = 187u16;
        let mut leader = vec![
            FloppyLeaderPage::SEAL,
            FloppyLeaderPage::VERSION,
            T_UNASSIGNED,
            0, 100, // createDate
            0, 200, // lastWrittenDate
            0, 1, // size
            0, 0, // offset
            0, 1, // totalSize
            0, 6, // totalSizeInBytes
            4, // nameLength
            name_max,
        ];
        let name = b"GERM";
        for pair in name.chunks(2) {
            leader.push(((pair[0] as u16) << 8) | pair[1] as u16);
        }
        for _ in 0..(name_max / 2 - 2) {
            leader.push(0);
        }
        leader.push(1); // clientDataLength
        leader.push(client_max);
        leader.push(0xCAFE);
        for _ in 0..client_max - 1 {
            leader.push(0);
        }
        assert_eq!(leader.len(), PAGE_SIZE as usize);
        // contents page
        leader.extend_from_slice(&[0x1122, 0x3344, 0x5566]);
        write_words(11, &leader);

        image
    }

    fn attach(image: &[u8]) -> (tempfile::NamedTempFile, Arc<DiskFile>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(image).unwrap();
        file.flush().unwrap();
        let disk = Arc::new(DiskFile::attach(file.path().to_str().unwrap()).unwrap());
        (file, disk)
    }

    #[test]
    fn decode_volume_and_leader() {
        let image = build_image();
        let (_file, disk) = attach(&image);
        let floppy = FloppyDisk::new(Arc::clone(&disk));

        let nine = SectorNine::read(&floppy);
        assert_eq!(nine.cylinders, 80);
        assert_eq!(nine.file_list, 10);
        assert_eq!(nine.label, "AB");

        let list = FileList::read(&floppy, nine.file_list as u32, nine.file_list_size as u32);
        assert_eq!(list.count, 1);
        assert_eq!(list.files[0].location, 11);

        let leaders = list_floppy(disk);
        assert_eq!(leaders.len(), 1);
        let leader = &leaders[0];
        assert_eq!(leader.name, "GERM");
        assert_eq!(leader.client_data, vec![0xCAFE]);
        assert_eq!(leader.contents, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(leader.create_date, 100);
    }

    #[test]
    #[should_panic]
    fn bad_seal_is_fatal() {
        let mut image = build_image();
        // corrupt the first word of sector nine
        let base = 8 * BYTES_PER_PAGE as usize;
        image[base] ^= 0xff;
        let (_file, disk) = attach(&image);
        let floppy = FloppyDisk::new(disk);
        SectorNine::read(&floppy);
    }
}
