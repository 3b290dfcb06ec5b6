//! Replays a short allocation session over the real program break and prints
//! the break after every step. Run with `RUST_LOG=trace` to see what the heap
//! does underneath.

use std::{ptr::NonNull, slice};

use brkalloc::{AllocError, Heap};

fn print_break(heap: &mut Heap, label: &str) {
    println!("[{label}] program break = {:?}", heap.current_break());
}

#[cfg(unix)]
fn process_heap() -> Option<Heap> {
    Heap::process()
}

#[cfg(windows)]
fn process_heap() -> Option<Heap> {
    Some(Heap::default())
}

fn main() -> Result<(), AllocError> {
    env_logger::init();

    let Some(mut heap) = process_heap() else {
        eprintln!("the program break is already owned");
        return Ok(());
    };
    print_break(&mut heap, "start");

    // 1) A small allocation, rounded up to 12 bytes.
    let a = heap.allocate(10)?;
    unsafe { slice::from_raw_parts_mut(a.as_ptr(), 10) }.copy_from_slice(b"0123456789");
    println!("\n[1] allocate(10) = {a:p}, valid = {}", heap.is_valid(a));
    print_break(&mut heap, "1");

    // 2) 80 zeroed u32 right after it.
    let b = heap.zero_allocate(80, size_of::<u32>())?;
    let zeroed = unsafe { slice::from_raw_parts(b.as_ptr(), 320) }
        .iter()
        .all(|&byte| byte == 0);
    println!("\n[2] zero_allocate(80, 4) = {b:p}, zeroed = {zeroed}");
    print_break(&mut heap, "2");

    // 3) `a` can't grow in place, its neighbour is in use.
    let a2 = heap.resize(Some(a), 80)?;
    let prefix = unsafe { slice::from_raw_parts(a2.as_ptr(), 10) };
    println!(
        "\n[3] resize(a, 80) = {a2:p}, moved = {}, content = {:?}",
        a2 != a,
        String::from_utf8_lossy(prefix)
    );
    print_break(&mut heap, "3");

    // 4) Releasing the tail moves the break back.
    heap.release(Some(a2));
    println!("\n[4] release(a2), b still valid = {}", heap.is_valid(b));
    print_break(&mut heap, "4");

    // 5) Anything we didn't hand out is ignored.
    let mut local = 0u32;
    heap.release(Some(NonNull::from(&mut local).cast()));
    println!("\n[5] release(&local) ignored, heap ok = {:?}", heap.check());

    // 6) `b` merges with the free `a` and the whole heap goes back.
    heap.release(Some(b));
    println!("\n[6] release(b), heap empty = {}", heap.is_empty());
    print_break(&mut heap, "end");

    Ok(())
}
