use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nxio::codec::{CompressionFormat, Yaz0Codec, ZstdCodec};
use nxio::swizzle::{assemble_image, deswizzle, extract_all, swizzle, Surface};
use nxio::texture::{TexFormat, TextureInfo};

fn bench_swizzle(c: &mut Criterion) {
    let surface = Surface::for_format(TexFormat::Rgba8Unorm, 512, 512);
    let linear: Vec<u8> = (0..surface.linear_size()).map(|i| i as u8).collect();
    let tiled = swizzle(&surface, &linear).unwrap();

    c.bench_function("swizzle_rgba8_512", |b| b.iter(|| swizzle(&surface, black_box(&linear))));
    c.bench_function("deswizzle_rgba8_512", |b| b.iter(|| deswizzle(&surface, black_box(&tiled))));
}

fn bench_mip_chain(c: &mut Criterion) {
    let tex = TextureInfo::new(TexFormat::Bc1Unorm, 1024, 1024).with_mips(11);
    let levels: Vec<Vec<u8>> = (0..11)
        .map(|m| vec![0x5Au8; TexFormat::Bc1Unorm.image_size((1024 >> m).max(1), (1024 >> m).max(1)) as usize])
        .collect();
    let image = assemble_image(&tex, &levels).unwrap();

    c.bench_function("extract_all_bc1_1024_11mips", |b| b.iter(|| extract_all(&tex, black_box(&image))));
}

fn bench_codecs(c: &mut Criterion) {
    let data: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let yaz0 = Yaz0Codec::default();
    let zstd = ZstdCodec::default();
    let packed = yaz0.compress_bytes(&data).unwrap();

    c.bench_function("yaz0_compress_256k", |b| b.iter(|| yaz0.compress_bytes(black_box(&data))));
    c.bench_function("yaz0_decompress_256k", |b| b.iter(|| yaz0.decompress_bytes(black_box(&packed))));
    c.bench_function("zstd_compress_256k", |b| b.iter(|| zstd.compress_bytes(black_box(&data))));
}

criterion_group!(benches, bench_swizzle, bench_mip_chain, bench_codecs);
criterion_main!(benches);
