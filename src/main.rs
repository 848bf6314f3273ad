use std::env;
use std::path::Path;
use std::sync::Arc;

use filecache::local_cache::LocalFileCache;
use filecache::transport::HttpFileStore;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        panic!("Please specify the remote base URL, the cache parent directory and the file to fetch");
    }
    let base_url = &args[1];
    let cache_parent = &args[2];
    let remote_ref_name = &args[3];
    let kilobyte_capacity = if args.len() > 4 {
        args[4].parse().expect("Invalid kilobyte capacity")
    } else {
        1024 * 1024
    };

    let store = Arc::new(HttpFileStore::new(base_url).expect("Failure creating the remote store"));
    let cache = LocalFileCache::new(Path::new(cache_parent), kilobyte_capacity, None, store)
        .expect("Failure creating the cache");
    let local_path = cache
        .get_file(remote_ref_name, false)
        .expect("Failure fetching the file");
    println!("{}", local_path.display());
}
