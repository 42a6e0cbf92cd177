use kernel_info::memory::{KERNEL_VIRTUAL_BASE, SELF_MAP_BASE};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_testing::{BootImage, SoftMachine, StackFrames};
use kernel_vmem::{AddressSpace, BootDirectory, Fatal, MapError, MapFlags, PdIndex};

const RAM: u32 = 8 << 20;
const KERNEL_BYTES: u32 = 64 << 10;

fn frames() -> StackFrames {
    StackFrames::new(PhysicalAddress::new(4 << 20), PhysicalAddress::new(RAM))
}

fn bootstrap<'m>(machine: &'m SoftMachine, frames: &mut StackFrames) -> AddressSpace<'m, SoftMachine> {
    let image = BootImage::install(machine, KERNEL_BYTES);
    let boot = unsafe { BootDirectory::new(machine, image.directory) }.unwrap();
    boot.bootstrap(frames, VirtualAddress::new(SELF_MAP_BASE)).unwrap()
}

#[test]
fn bootstrap_builds_the_self_map() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let space = bootstrap(&machine, &mut frames);

    // The first frame handed out holds the table of tables.
    let tables = PhysicalAddress::new(4 << 20);
    assert_eq!(machine.pde(1023) & 0xFFFF_F000, tables.as_u32());
    assert_eq!(machine.walk(VirtualAddress::new(0xFFFF_F000)), Some(tables));

    // The boot table is visible at its slot in the self-map.
    let window = PdIndex::from(VirtualAddress::new(KERNEL_VIRTUAL_BASE));
    assert_eq!(
        machine.walk(space.table_address(window)),
        Some(PhysicalAddress::new(0x0010_1000))
    );

    // The scratch slot is gone again.
    let scratch = VirtualAddress::new(KERNEL_VIRTUAL_BASE);
    assert_eq!(machine.walk(scratch), None);
    assert!(machine.invalidations().contains(&scratch));
}

#[test]
fn bootstrap_rejects_unusable_regions() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let image = BootImage::install(&machine, KERNEL_BYTES);

    let boot = unsafe { BootDirectory::new(&machine, image.directory) }.unwrap();
    let misaligned = VirtualAddress::new(SELF_MAP_BASE + 0x1000);
    assert_eq!(
        boot.bootstrap(&mut frames, misaligned).err(),
        Some(Fatal::SelfMapMisaligned(misaligned))
    );

    let boot = unsafe { BootDirectory::new(&machine, image.directory) }.unwrap();
    let occupied = VirtualAddress::new(KERNEL_VIRTUAL_BASE);
    assert_eq!(
        boot.bootstrap(&mut frames, occupied).err(),
        Some(Fatal::SelfMapOccupied(occupied))
    );
}

#[test]
fn early_mappings_go_into_the_boot_table() {
    let machine = SoftMachine::new(RAM);
    let image = BootImage::install(&machine, KERNEL_BYTES);
    let mut boot = unsafe { BootDirectory::new(&machine, image.directory) }.unwrap();

    let va = VirtualAddress::new(KERNEL_VIRTUAL_BASE + 0x0020_0000);
    let frame = PhysicalAddress::new(0x0020_0000).page::<Size4K>();
    boot.map_early(va, frame, MapFlags::KERNEL_RW).unwrap();
    assert_eq!(machine.walk(va), Some(frame.base()));

    let outside = VirtualAddress::new(0x0040_0000);
    assert_eq!(
        boot.map_early(outside, frame, MapFlags::KERNEL_RW),
        Err(Fatal::MissingBootTable(VirtualAddress::new(0x0040_0000)))
    );
}

#[test]
fn map_then_is_mapped_finds_the_page() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    let va = VirtualAddress::new(0xD000_0000);
    let pa = PhysicalAddress::new(0x0030_0000);
    space.map(&mut frames, va, pa, MapFlags::WRITABLE).unwrap();

    assert_eq!(space.is_mapped(pa), Some(va));
    assert_eq!(space.is_mapped(pa + 0x123), Some(va + 0x123));
    assert_eq!(space.translate(va + 0x10), Some(pa + 0x10));
    assert_eq!(machine.walk(va), Some(pa));
    assert_eq!(machine.pte(va).unwrap() & 0b11, 0b11);
}

#[test]
fn new_tables_are_created_once_and_zeroed() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);
    let before = frames.available();

    let va = VirtualAddress::new(0xD000_0000);
    space.map(&mut frames, va, PhysicalAddress::new(0x0030_0000), MapFlags::WRITABLE).unwrap();
    assert_eq!(frames.available(), before - 1);

    space
        .map(&mut frames, va + 0x1000, PhysicalAddress::new(0x0030_1000), MapFlags::WRITABLE)
        .unwrap();
    assert_eq!(frames.available(), before - 1);

    assert_eq!(machine.pte(va + 0x2000), Some(0));
    assert_eq!(machine.pte(va + 0x003F_F000), Some(0));
}

#[test]
fn map_replaces_an_existing_mapping() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    let va = VirtualAddress::new(0xD000_0000);
    space.map(&mut frames, va, PhysicalAddress::new(0x0030_0000), MapFlags::WRITABLE).unwrap();
    assert!(!machine.invalidations().contains(&va));

    space.map(&mut frames, va, PhysicalAddress::new(0x0031_0000), MapFlags::empty()).unwrap();
    assert_eq!(space.translate(va), Some(PhysicalAddress::new(0x0031_0000)));
    assert_eq!(space.is_mapped(PhysicalAddress::new(0x0030_0000)), None);
    assert_eq!(machine.pte(va).unwrap() & 0b10, 0);
    assert!(machine.invalidations().contains(&va));
}

#[test]
fn unmap_clears_the_entry() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    let va = VirtualAddress::new(0xD000_5000);
    let pa = PhysicalAddress::new(0x0030_0000);
    space.map(&mut frames, va, pa, MapFlags::WRITABLE).unwrap();
    space.unmap(va);

    assert!(!space.is_present(va));
    assert_eq!(machine.walk(va), None);
    assert_eq!(space.is_mapped(pa), None);
    assert!(machine.invalidations().contains(&va));
}

#[test]
fn unmap_without_a_table_does_nothing() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);
    let seen = machine.invalidations().len();

    space.unmap(VirtualAddress::new(0x0800_0000));
    space.unmap(VirtualAddress::new(SELF_MAP_BASE));
    assert_eq!(machine.invalidations().len(), seen);
    assert!(space.is_present(VirtualAddress::new(0xFFFF_F000)));
}

#[test]
fn the_self_map_is_reserved() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    let va = VirtualAddress::new(SELF_MAP_BASE + 0x1000);
    assert_eq!(
        space.map(&mut frames, va, PhysicalAddress::new(0x0030_0000), MapFlags::WRITABLE),
        Err(MapError::ReservedRegion(va))
    );
}

#[test]
fn out_of_frames_leaves_no_half_built_table() {
    let machine = SoftMachine::new(RAM);
    let mut frames = StackFrames::new(PhysicalAddress::new(4 << 20), PhysicalAddress::new((4 << 20) + 0x1000));
    let mut space = bootstrap(&machine, &mut frames);
    assert_eq!(frames.available(), 0);

    let va = VirtualAddress::new(0xD000_0000);
    assert_eq!(
        space.map(&mut frames, va, PhysicalAddress::new(0x0030_0000), MapFlags::WRITABLE),
        Err(MapError::OutOfFrames)
    );
    assert_eq!(machine.pde(va.directory_index()), 0);

    // Slots under an existing table need no frame.
    let kernel = VirtualAddress::new(KERNEL_VIRTUAL_BASE + 0x0030_0000);
    space
        .map(&mut frames, kernel, PhysicalAddress::new(0x0030_0000), MapFlags::WRITABLE)
        .unwrap();
}

#[test]
fn user_mappings_open_the_directory_entry() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    let va = VirtualAddress::new(0x0040_0000);
    space.map(&mut frames, va, PhysicalAddress::new(0x0030_0000), MapFlags::WRITABLE).unwrap();
    assert_eq!(machine.pde(va.directory_index()) & 0x4, 0);

    space
        .map(&mut frames, va + 0x1000, PhysicalAddress::new(0x0030_1000), MapFlags::WRITABLE | MapFlags::USER)
        .unwrap();
    assert_eq!(machine.pde(va.directory_index()) & 0x4, 0x4);
    assert_eq!(machine.pte(va + 0x1000).unwrap() & 0x4, 0x4);
}

#[test]
fn map_on_or_after_takes_the_next_free_page() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    let hint = VirtualAddress::new(0xE000_0000);
    let first = space
        .map_on_or_after(&mut frames, hint, PhysicalAddress::new(0xFEE0_0020), MapFlags::DEVICE)
        .unwrap();
    assert_eq!(first, VirtualAddress::new(0xE000_0020));

    let second = space
        .map_on_or_after(&mut frames, hint, PhysicalAddress::new(0xFEC0_0000), MapFlags::DEVICE)
        .unwrap();
    assert_eq!(second, VirtualAddress::new(0xE000_1000));
    assert_eq!(machine.walk(second), Some(PhysicalAddress::new(0xFEC0_0000)));
    assert_eq!(machine.pte(second).unwrap() & 0x10, 0x10);
}

#[test]
fn map_on_or_after_never_enters_the_self_map() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    let last = VirtualAddress::new(SELF_MAP_BASE - 0x1000);
    space.map(&mut frames, last, PhysicalAddress::new(0x0030_0000), MapFlags::WRITABLE).unwrap();
    assert_eq!(
        space.map_on_or_after(&mut frames, last, PhysicalAddress::new(0x0031_0000), MapFlags::WRITABLE),
        Err(MapError::NoFreeSlot)
    );
}

#[test]
fn map_on_or_before_walks_downward() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    // 0xC010_0000 and up hold the kernel image.
    let hint = VirtualAddress::new(KERNEL_VIRTUAL_BASE + 0x0010_1000);
    let va = space
        .map_on_or_before(&mut frames, hint, PhysicalAddress::new(0x0030_0004), MapFlags::WRITABLE)
        .unwrap();
    assert_eq!(va, VirtualAddress::new(KERNEL_VIRTUAL_BASE + 0x000F_F004));

    let zero = VirtualAddress::zero();
    space.map(&mut frames, zero, PhysicalAddress::new(0x0031_0000), MapFlags::WRITABLE).unwrap();
    assert_eq!(
        space.map_on_or_before(&mut frames, zero, PhysicalAddress::new(0x0032_0000), MapFlags::WRITABLE),
        Err(MapError::NoFreeSlot)
    );
}

#[test]
fn table_view_maps_device_registers() {
    let machine = SoftMachine::new(RAM);
    let mut frames = frames();
    let mut space = bootstrap(&machine, &mut frames);

    let window = PdIndex::from(VirtualAddress::new(KERNEL_VIRTUAL_BASE));
    let mmio = PhysicalAddress::new(0xFEE0_00F0);
    let va = {
        let mut view = space.table_view(window).unwrap();
        assert!(!view.is_full());
        assert!(!view.is_empty());
        assert_eq!(view.next_available_page().map(|i| i.as_usize()), Some(0));
        let va = view.map_next_available_page_to_address(mmio, &mut frames).unwrap();
        assert_eq!(view.is_mapped(mmio), Some(va));
        va
    };

    assert_eq!(va, VirtualAddress::new(KERNEL_VIRTUAL_BASE + 0xF0));
    assert_eq!(frames.reserved, vec![mmio.page::<Size4K>()]);
    // Present, writable and uncached.
    assert_eq!(machine.pte(va).unwrap() & 0x13, 0x13);
    assert_eq!(space.is_mapped(mmio), Some(va));

    assert!(space.table_view(PdIndex::from(VirtualAddress::new(SELF_MAP_BASE))).is_none());
    assert!(space.table_view(PdIndex::new(1)).is_none());
}
