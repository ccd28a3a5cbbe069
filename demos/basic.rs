use mapalloc::MapAlloc;

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut allocator = MapAlloc::new();

    unsafe {
        let addr1 = allocator.alloc(8);
        log_alloc(addr1, 8);

        let addr2 = allocator.alloc(80);
        log_alloc(addr2, 80);

        let addr3 = allocator.alloc_zeroed(4, 8);
        log_alloc(addr3, 32);

        let addr2 = allocator.realloc(addr2, 160);
        println!("Regrew the second chunk to 160 bytes: {addr2:?}");

        allocator.free(addr1);
        allocator.free(addr2);
        allocator.free(addr3);

        println!("Regions still mapped: {}", allocator.region_count());
    }
}
