use std::collections::HashMap;
use std::thread;

#[global_allocator]
static GLOBAL: slabarena::Allocator = slabarena::Allocator;

#[test]
fn collections_churn() {
  let mut map: HashMap<String, Vec<u64>> = HashMap::new();
  for i in 0..10_000u64 {
    map
      .entry(format!("key-{}", i % 257))
      .or_default()
      .push(i);
  }
  assert_eq!(map.len(), 257);
  assert_eq!(map.values().map(Vec::len).sum::<usize>(), 10_000);

  let mut text = String::new();
  for i in 0..5_000 {
    text.push_str(&i.to_string());
  }
  assert!(text.starts_with("0123"));
  text.shrink_to_fit();
  assert!(text.capacity() >= text.len());
}

#[test]
fn large_and_overaligned_values() {
  #[repr(align(256))]
  struct Wide([u8; 512]);

  let big = vec![7u8; 3 * 1024 * 1024];
  assert!(big.iter().all(|&b| b == 7));

  let wide: Vec<Box<Wide>> = (0..32).map(|i| Box::new(Wide([i as u8; 512]))).collect();
  for (i, w) in wide.iter().enumerate() {
    assert_eq!(&**w as *const Wide as usize % 256, 0);
    assert!(w.0.iter().all(|&b| b == i as u8));
  }
}

#[test]
fn threads_share_the_global_heap() {
  let handles: Vec<_> = (0..8)
    .map(|t| {
      thread::spawn(move || {
        let mut v: Vec<Box<[u8]>> = Vec::new();
        for i in 0..2_000usize {
          v.push(vec![t as u8; 1 + (i * 37) % 3000].into_boxed_slice());
          if i % 3 == 0 {
            v.swap_remove(i % v.len());
          }
        }
        v.iter().all(|b| b.iter().all(|&x| x == t as u8))
      })
    })
    .collect();

  for handle in handles {
    assert!(handle.join().unwrap());
  }

  let stats = slabarena::global_heap().unwrap().stats();
  assert!(stats.arenas >= 1);
}
