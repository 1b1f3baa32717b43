//! End-to-end image production scenarios: the whole pipeline from a
//! logical tree to the byte stream, checked against the on-disc layout.

use ferriso::stream::{share, IsoStream, MemoryStream, OpenSize, StreamId};
use ferriso::{create_source, Image, IsoError, Profile, Section, WriteOpts, BLOCK_SIZE};

/// Pull a whole image out of the consumer handle.
fn produce(image: Image, opts: &mut WriteOpts) -> Vec<u8> {
    let mut src = create_source(image, opts).expect("pipeline starts");
    let expected = src.get_size();
    let mut out = Vec::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let n = src.read(&mut block).expect("image read");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&block[..n]);
    }
    assert_eq!(out.len() as u64, expected, "stream length equals get_size");
    out
}

fn block(iso: &[u8], lba: usize) -> &[u8] {
    &iso[lba * BLOCK_SIZE..(lba + 1) * BLOCK_SIZE]
}

/// Minimal directory-record view for assertions.
#[derive(Debug, Clone)]
struct Record {
    name: Vec<u8>,
    block: u32,
    size: u32,
    flags: u8,
    /// Bytes between the identifier padding and the end of the record.
    system_use: Vec<u8>,
}

impl Record {
    fn is_dir(&self) -> bool {
        self.flags & 2 != 0
    }
}

/// Parse all records of one directory area, block-boundary padding
/// included.
fn parse_dir(area: &[u8]) -> Vec<Record> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < area.len() {
        let len = area[pos] as usize;
        if len == 0 {
            // zero fill up to the next block boundary
            pos = (pos / BLOCK_SIZE + 1) * BLOCK_SIZE;
            continue;
        }
        let rec = &area[pos..pos + len];
        let len_fi = rec[32] as usize;
        let mut su_start = 33 + len_fi;
        if len_fi % 2 == 0 {
            su_start += 1;
        }
        out.push(Record {
            name: rec[33..33 + len_fi].to_vec(),
            block: u32::from_le_bytes(rec[2..6].try_into().unwrap()),
            size: u32::from_le_bytes(rec[10..14].try_into().unwrap()),
            flags: rec[25],
            system_use: rec[su_start.min(len)..].to_vec(),
        });
        pos += len;
    }
    out
}

fn root_dir_area<'a>(iso: &'a [u8], pvd_lba: usize) -> &'a [u8] {
    let pvd = block(iso, pvd_lba);
    // root directory record sits at offset 156 of the PVD
    let root_block = u32::from_le_bytes(pvd[158..162].try_into().unwrap()) as usize;
    let root_size = u32::from_le_bytes(pvd[166..170].try_into().unwrap()) as usize;
    &iso[root_block * BLOCK_SIZE..root_block * BLOCK_SIZE + root_size]
}

#[test]
fn basic_level1_hello_image() {
    let mut image = Image::new("HELLO");
    let root = image.root();
    image
        .add_file(root, "hello.txt", share(MemoryStream::new(b"hi\n".to_vec())))
        .unwrap();

    let mut opts = WriteOpts::new(Profile::Basic);
    let iso = produce(image, &mut opts);

    // 16 system area + PVD + terminator + root dir + 2 path tables,
    // padded to 32, plus one data block
    assert_eq!(iso.len(), 33 * BLOCK_SIZE);

    let pvd = block(&iso, 16);
    assert_eq!(pvd[0], 1);
    assert_eq!(&pvd[1..6], b"CD001");
    // volume space size, both-endian
    assert_eq!(u32::from_le_bytes(pvd[80..84].try_into().unwrap()), 33);

    let terminator = block(&iso, 17);
    assert_eq!(terminator[0], 255);
    assert_eq!(&terminator[1..6], b"CD001");

    let records = parse_dir(root_dir_area(&iso, 16));
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].name, vec![0x00], "first record is .");
    assert_eq!(records[1].name, vec![0x01], "second record is ..");
    assert!(records[0].is_dir() && records[1].is_dir());

    let hello = &records[2];
    assert_eq!(hello.name, b"HELLO.TXT;1".to_vec());
    assert_eq!(hello.size, 3);
    let data = block(&iso, hello.block as usize);
    assert_eq!(&data[..3], b"hi\n");
    assert!(data[3..].iter().all(|&b| b == 0));
}

#[test]
fn empty_image_pads_to_32_blocks() {
    let image = Image::new("EMPTY");
    let mut opts = WriteOpts::new(Profile::Basic);
    let iso = produce(image, &mut opts);
    assert_eq!(iso.len(), 32 * BLOCK_SIZE);

    // empty root: exactly one block holding only "." and ".."
    let records = parse_dir(root_dir_area(&iso, 16));
    assert_eq!(records.len(), 2);
}

#[test]
fn distribution_symlink_lives_in_rr_only() {
    let mut image = Image::new("LINKS");
    let root = image.root();
    image.add_symlink(root, "link", "target").unwrap();

    let mut opts = WriteOpts::new(Profile::Distribution);
    let iso = produce(image, &mut opts);

    // ECMA-119 tree: the symlink is a zero-length record whose SUSP area
    // carries an SL field with the component "target"
    let records = parse_dir(root_dir_area(&iso, 16));
    let link = records
        .iter()
        .find(|r| r.name.starts_with(b"LINK"))
        .expect("symlink record present");
    assert_eq!(link.size, 0);
    let su = &link.system_use;
    let sl_pos = su
        .windows(2)
        .position(|w| w == b"SL")
        .expect("SL field present");
    let sl = &su[sl_pos..];
    // component record: flags 0, length 6, "target"
    assert_eq!(&sl[5..7], &[0, 6]);
    assert_eq!(&sl[7..13], b"target");
    assert!(su.windows(2).any(|w| w == b"NM"), "NM field present");

    // Joliet tree: the SVD at block 17 knows nothing about the symlink
    let svd = block(&iso, 17);
    assert_eq!(svd[0], 2);
    assert_eq!(&svd[88..91], b"%/E");
    let joliet_records = parse_dir(root_dir_area(&iso, 17));
    assert_eq!(joliet_records.len(), 2, "Joliet omits symlinks");
}

#[test]
fn rockridge_root_carries_sp_and_er() {
    let mut image = Image::new("RR");
    let root = image.root();
    image
        .add_file(root, "a.txt", share(MemoryStream::new(vec![1])))
        .unwrap();

    let mut opts = WriteOpts::new(Profile::Backup);
    let iso = produce(image, &mut opts);

    let records = parse_dir(root_dir_area(&iso, 16));
    let dot = &records[0];
    assert_eq!(&dot.system_use[..2], b"SP");
    assert_eq!(&dot.system_use[4..6], &[0xBE, 0xEF]);
    // the ER landed either inline or in the continuation area the CE
    // field points to
    let inline_er = dot.system_use.windows(2).any(|w| w == b"ER");
    let ce = dot.system_use.windows(2).any(|w| w == b"CE");
    assert!(inline_er || ce, "ER reachable from the root record");
    if ce {
        let ce_pos = dot
            .system_use
            .windows(2)
            .position(|w| w == b"CE")
            .unwrap();
        let ce_field = &dot.system_use[ce_pos..ce_pos + 28];
        let ce_block = u32::from_le_bytes(ce_field[4..8].try_into().unwrap()) as usize;
        let ce_offset = u32::from_le_bytes(ce_field[12..16].try_into().unwrap()) as usize;
        let ce_len = u32::from_le_bytes(ce_field[20..24].try_into().unwrap()) as usize;
        let span = &iso[ce_block * BLOCK_SIZE + ce_offset..][..ce_len];
        assert!(span.windows(2).any(|w| w == b"ER"));
        assert!(
            span.windows(9).any(|w| w == b"IEEE_1282"),
            "RRIP 1.12 signature"
        );
    }
}

#[test]
fn name_collisions_get_mangled() {
    let mut image = Image::new("MANGLE");
    let root = image.root();
    for name in ["foo.txt", "Foo.txt", "FOO.txt"] {
        image
            .add_file(root, name, share(MemoryStream::new(vec![0])))
            .unwrap();
    }

    let mut opts = WriteOpts::new(Profile::Basic);
    let iso = produce(image, &mut opts);

    let records = parse_dir(root_dir_area(&iso, 16));
    let mut names: Vec<String> = records[2..]
        .iter()
        .map(|r| String::from_utf8(r.name.clone()).unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["FOO0.TXT;1", "FOO1.TXT;1", "FOO2.TXT;1"]);
    for n in &names {
        let bare = n.trim_end_matches(";1");
        assert!(bare.len() <= 12);
    }
}

#[test]
fn deep_paths_are_relocated_with_cl_links() {
    let mut image = Image::new("DEEP");
    let mut cur = image.root();
    for name in ["a", "b", "c", "d", "e", "f", "g", "h", "i"] {
        cur = image.add_dir(cur, name).unwrap();
    }
    image
        .add_file(cur, "leaf", share(MemoryStream::new(b"leaf".to_vec())))
        .unwrap();

    let mut opts = WriteOpts::new(Profile::Backup);
    let iso = produce(image, &mut opts);

    // walk /A/B/C/D/E/F/G/H
    let mut area = root_dir_area(&iso, 16).to_vec();
    let root_records = parse_dir(&area);
    let rr_moved = root_records
        .iter()
        .find(|r| r.name == b"RR_MOVED".to_vec())
        .expect("relocation dir in root")
        .clone();

    for want in [b"A", b"B", b"C", b"D", b"E", b"F", b"G", b"H"] {
        let records = parse_dir(&area);
        let next = records
            .iter()
            .find(|r| r.name == want.to_vec())
            .unwrap_or_else(|| panic!("missing {}", want[0] as char));
        assert!(next.is_dir());
        area = iso[next.block as usize * BLOCK_SIZE..][..next.size as usize].to_vec();
    }

    // inside H: a placeholder named I, not a directory, with a CL link
    let h_records = parse_dir(&area);
    let placeholder = h_records.iter().find(|r| r.name == b"I".to_vec()).unwrap();
    assert!(!placeholder.is_dir(), "placeholder is not a directory");
    let su = &placeholder.system_use;
    let cl_pos = su
        .windows(2)
        .position(|w| w == b"CL")
        .expect("CL field on placeholder");
    let real_block = u32::from_le_bytes(su[cl_pos + 4..cl_pos + 8].try_into().unwrap());

    // the CL target is the real directory, a child of RR_MOVED
    let moved_area =
        &iso[rr_moved.block as usize * BLOCK_SIZE..][..rr_moved.size as usize];
    let moved_records = parse_dir(moved_area);
    let real = moved_records.iter().find(|r| r.name == b"I".to_vec()).unwrap();
    assert!(real.is_dir());
    assert_eq!(real.block, real_block);
    assert!(
        moved_records[2..]
            .iter()
            .any(|r| r.system_use.windows(2).any(|w| w == b"RE")),
        "relocated dir carries RE"
    );

    // and the real directory still holds the leaf file
    let i_area = &iso[real.block as usize * BLOCK_SIZE..][..real.size as usize];
    let i_records = parse_dir(i_area);
    let leaf = i_records.iter().find(|r| r.name.starts_with(b"LEAF")).unwrap();
    assert_eq!(leaf.size, 4);
}

#[test]
fn appendable_session_references_old_content() {
    let mut image = Image::new("GROW");
    let root = image.root();
    image
        .add_file_from_old_session(
            root,
            "a",
            share(MemoryStream::new(b"X".to_vec())),
            vec![Section { block: 200, size: 1 }],
        )
        .unwrap();
    image
        .add_file(root, "b", share(MemoryStream::new(b"Y".to_vec())))
        .unwrap();

    let mut opts = WriteOpts::new(Profile::Basic)
        .with_appendable(true)
        .with_ms_block(1000);
    let iso = produce(image, &mut opts);

    // the stream starts at LBA 1000; descriptors still begin 16 blocks in
    let records = parse_dir(root_dir_area_ms(&iso, 16, 1000));
    let a = records.iter().find(|r| r.name == b"A.;1".to_vec()).unwrap();
    let b = records.iter().find(|r| r.name == b"B.;1".to_vec()).unwrap();
    assert_eq!(a.block, 200, "old content is referenced, not moved");
    assert!(b.block >= 1016, "new content lands in the new session");

    // only B's bytes are in the stream: system area, PVD, terminator,
    // root dir, two path tables, one data block
    assert_eq!(iso.len(), 22 * BLOCK_SIZE);
    let b_data = &iso[(b.block as usize - 1000) * BLOCK_SIZE..][..BLOCK_SIZE];
    assert_eq!(b_data[0], b'Y');
}

/// Like [`root_dir_area`] for a session that starts at a nonzero LBA.
fn root_dir_area_ms(iso: &[u8], pvd_off: usize, ms_block: usize) -> &[u8] {
    let pvd = block(iso, pvd_off);
    let root_block = u32::from_le_bytes(pvd[158..162].try_into().unwrap()) as usize;
    let root_size = u32::from_le_bytes(pvd[166..170].try_into().unwrap()) as usize;
    &iso[(root_block - ms_block) * BLOCK_SIZE..][..root_size]
}

#[test]
fn path_tables_list_root_first() {
    let mut image = Image::new("PT");
    let root = image.root();
    let sub = image.add_dir(root, "sub").unwrap();
    image.add_dir(sub, "inner").unwrap();

    let mut opts = WriteOpts::new(Profile::Basic);
    let iso = produce(image, &mut opts);

    let pvd = block(&iso, 16);
    let pt_size = u32::from_le_bytes(pvd[132..136].try_into().unwrap()) as usize;
    let l_pos = u32::from_le_bytes(pvd[140..144].try_into().unwrap()) as usize;
    let table = &iso[l_pos * BLOCK_SIZE..l_pos * BLOCK_SIZE + pt_size];

    // root: len 1, id 0x00, parent 1
    assert_eq!(table[0], 1);
    assert_eq!(table[8], 0);
    assert_eq!(u16::from_le_bytes(table[6..8].try_into().unwrap()), 1);

    // second entry: SUB with parent index 1
    let second = &table[10..];
    assert_eq!(second[0], 3);
    assert_eq!(&second[8..11], b"SUB");
    assert_eq!(u16::from_le_bytes(second[6..8].try_into().unwrap()), 1);

    // third entry: INNER with parent index 2
    let third = &second[12..];
    assert_eq!(third[0], 5);
    assert_eq!(&third[8..13], b"INNER");
    assert_eq!(u16::from_le_bytes(third[6..8].try_into().unwrap()), 2);
}

#[test]
fn deterministic_with_overridden_times() {
    fn build() -> Vec<u8> {
        let mut image = Image::new("SAME");
        let root = image.root();
        let sub = image.add_dir(root, "sub").unwrap();
        image
            .add_file(sub, "data.bin", share(MemoryStream::new(vec![42; 5000])))
            .unwrap();
        image
            .add_symlink(root, "l", "sub/data.bin")
            .unwrap();

        let mut opts = WriteOpts::new(Profile::Backup)
            .with_replace_timestamps(2, 1_000_000_000)
            .with_pvd_times(1_000_000_000, 1_000_000_000)
            .with_vol_uuid(*b"2001090203040506");
        opts.dir_rec_mtime = true;
        opts.always_gmt = true;
        opts.vol_expiration_time = 1_100_000_000;
        opts.vol_effective_time = 1_000_000_000;
        produce(image, &mut opts)
    }

    let a = build();
    let b = build();
    assert_eq!(a, b, "same tree and overrides give identical bytes");
}

/// A lazily zero-producing stream: big declared size, no allocation.
struct ZeroStream {
    size: u64,
    pos: u64,
    ino: u64,
}

impl ZeroStream {
    fn new(size: u64) -> Self {
        ZeroStream {
            size,
            pos: 0,
            ino: 0x5EED,
        }
    }
}

impl IsoStream for ZeroStream {
    fn class_name(&self) -> &'static str {
        "zero"
    }
    fn open(&mut self) -> ferriso::Result<OpenSize> {
        self.pos = 0;
        Ok(OpenSize::Exact)
    }
    fn close(&mut self) -> ferriso::Result<()> {
        Ok(())
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn read(&mut self, buf: &mut [u8]) -> ferriso::Result<usize> {
        let n = (self.size - self.pos).min(buf.len() as u64) as usize;
        buf[..n].fill(0);
        self.pos += n as u64;
        Ok(n)
    }
    fn is_repeatable(&self) -> bool {
        true
    }
    fn update_size(&mut self) -> ferriso::Result<()> {
        Ok(())
    }
    fn id(&self) -> StreamId {
        StreamId {
            fs_id: 99,
            dev_id: 0,
            ino_id: self.ino,
        }
    }
}

#[test]
fn cancellation_stops_the_writer() {
    let mut image = Image::new("BIG");
    let root = image.root();
    // 64 MiB of lazy zeros, far beyond the ring buffer
    image
        .add_file(root, "big.bin", share(ZeroStream::new(64 << 20)))
        .unwrap();

    let mut opts = WriteOpts::new(Profile::Basic).with_fifo_size(32);
    let mut src = create_source(image, &mut opts).expect("pipeline starts");

    // consume 1 MiB, then cancel
    let mut block = vec![0u8; BLOCK_SIZE];
    for _ in 0..512 {
        src.read(&mut block).expect("image read");
    }
    src.cancel();

    // at most one buffer turnover of already-produced blocks can still
    // drain before the writer's error surfaces
    let mut got_err = false;
    for _ in 0..64 {
        match src.read(&mut block) {
            Err(IsoError::BufRead(_)) => {
                got_err = true;
                break;
            }
            Ok(_) => {}
            Err(other) => panic!("unexpected error after cancel: {other:?}"),
        }
    }
    assert!(got_err, "read reports the cancellation");
}

#[cfg(feature = "el-torito")]
#[test]
fn bootable_image_emits_catalog_and_boot_record() {
    use ferriso::eltorito::BootCatalog;

    let mut image = Image::new("BOOT");
    let root = image.root();
    let mut boot_img = vec![0u8; 4096];
    boot_img[0] = 0xEB;
    let img_node = image
        .add_file(root, "boot.img", share(MemoryStream::new(boot_img)))
        .unwrap();
    let cat_node = image.add_boot_catalog_node(root, "boot.catalog").unwrap();
    image.boot_catalog = Some(BootCatalog::new(cat_node, img_node));

    let mut opts = WriteOpts::new(Profile::Basic);
    let iso = produce(image, &mut opts);

    // boot record volume descriptor right after the PVD
    let brvd = block(&iso, 17);
    assert_eq!(brvd[0], 0);
    assert_eq!(&brvd[1..6], b"CD001");
    assert_eq!(&brvd[7..30], b"EL TORITO SPECIFICATION");
    let catalog_lba = u32::from_le_bytes(brvd[71..75].try_into().unwrap()) as usize;
    assert!(catalog_lba >= 32);

    // the catalog: validation entry plus a bootable default entry
    let catalog = block(&iso, catalog_lba);
    assert_eq!(catalog[0], 0x01);
    assert_eq!(&catalog[30..32], &[0x55, 0xAA]);
    let mut sum = 0u16;
    for pair in catalog[..32].chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_le_bytes([pair[0], pair[1]]));
    }
    assert_eq!(sum, 0, "validation entry checksums to zero");

    assert_eq!(catalog[32], 0x88, "default entry is bootable");
    let load_rba = u32::from_le_bytes(catalog[40..44].try_into().unwrap());
    let sectors = u16::from_le_bytes(catalog[38..40].try_into().unwrap());
    assert_eq!(sectors, 8, "4096 bytes are eight 512-byte sectors");

    // the boot image itself is a plain file in the tree
    let records = parse_dir(root_dir_area(&iso, 16));
    let img_rec = records
        .iter()
        .find(|r| r.name == b"BOOT.IMG;1".to_vec())
        .unwrap();
    assert_eq!(img_rec.block, load_rba);
    assert_eq!(block(&iso, load_rba as usize)[0], 0xEB);
}

#[cfg(feature = "el-torito")]
#[test]
fn boot_info_table_is_patched_into_the_stream() {
    use ferriso::eltorito::BootCatalog;

    let mut image = Image::new("ISOLINUX");
    let root = image.root();
    let boot_img: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    let img_node = image
        .add_file(root, "isolinux.bin", share(MemoryStream::new(boot_img.clone())))
        .unwrap();
    let cat_node = image.add_boot_catalog_node(root, "boot.cat").unwrap();
    let mut catalog = BootCatalog::new(cat_node, img_node);
    catalog.isolinux_patch = true;
    image.boot_catalog = Some(catalog);

    let mut opts = WriteOpts::new(Profile::Basic);
    let iso = produce(image, &mut opts);

    let records = parse_dir(root_dir_area(&iso, 16));
    let img_rec = records
        .iter()
        .find(|r| r.name.starts_with(b"ISOLINUX"))
        .unwrap();
    let data = block(&iso, img_rec.block as usize);

    // bytes before the table are untouched
    assert_eq!(&data[..8], &boot_img[..8]);
    // table: pvd lba, file lba, file length, checksum over bytes 64..
    assert_eq!(u32::from_le_bytes(data[8..12].try_into().unwrap()), 16);
    assert_eq!(
        u32::from_le_bytes(data[12..16].try_into().unwrap()),
        img_rec.block
    );
    assert_eq!(
        u32::from_le_bytes(data[16..20].try_into().unwrap()),
        boot_img.len() as u32
    );
    let mut checksum = 0u32;
    for word in boot_img[64..].chunks(4) {
        let mut bytes = [0u8; 4];
        bytes[..word.len()].copy_from_slice(word);
        checksum = checksum.wrapping_add(u32::from_le_bytes(bytes));
    }
    assert_eq!(
        u32::from_le_bytes(data[20..24].try_into().unwrap()),
        checksum
    );
    // the reserved span is zeroed, the rest of the image unchanged
    assert!(data[24..64].iter().all(|&b| b == 0));
    assert_eq!(&data[64..2048], &boot_img[64..2048]);
}

#[test]
fn protective_mbr_covers_the_image() {
    let mut image = Image::new("MBR");
    let root = image.root();
    image
        .add_file(root, "f", share(MemoryStream::new(vec![9; 100])))
        .unwrap();

    let mut opts = WriteOpts::new(Profile::Basic);
    opts.system_area_options = 1;
    let iso = produce(image, &mut opts);
    let blocks = (iso.len() / BLOCK_SIZE) as u32;

    assert_eq!(iso[510], 0x55);
    assert_eq!(iso[511], 0xAA);
    assert_eq!(iso[446], 0x80);
    assert_eq!(iso[450], 0xCD);
    let start = u32::from_le_bytes(iso[454..458].try_into().unwrap());
    let count = u32::from_le_bytes(iso[458..462].try_into().unwrap());
    assert_eq!(start, 1);
    assert_eq!(count, blocks * 4 - 1);
}
