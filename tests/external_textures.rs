mod common;

use common::{RecordingGpu, StubLoader, manager, pump, rgba};
use visual_textures::{
    FittingMode, ImageDimensions, LoadState, MultiplyOnLoad, ReloadPolicy, SamplingMode, Texture,
    TextureSet, UseAtlas, VisualUrl,
};

fn external_set(id: u64) -> TextureSet {
    TextureSet::from_texture(Texture {
        id,
        width: 4,
        height: 4,
    })
}

#[test]
fn registered_set_is_resolved_through_its_texture_url() {
    let loader = StubLoader::new();
    let gpu = RecordingGpu::new();
    let mut mgr = manager(&loader, &gpu);

    let set = external_set(77);
    let url_string = mgr.add_external_texture(set.clone());
    assert!(url_string.starts_with("texture:"));

    let url = VisualUrl::new(url_string);
    let id = url.texture_id().unwrap();
    assert_eq!(mgr.get_texture_state(id), LoadState::Uploaded);
    assert_eq!(mgr.get_texture_set(id), Some(set.clone()));
    assert_eq!(mgr.get_visual_url(id), Some(url.clone()));

    let mut masking = None;
    let mut premultiply = MultiplyOnLoad::LoadWithoutMultiply;
    let result = mgr.load_texture(
        &url,
        ImageDimensions::default(),
        FittingMode::default(),
        SamplingMode::default(),
        &mut masking,
        false,
        None,
        true,
        ReloadPolicy::Cached,
        &mut premultiply,
    );
    assert!(!result.loading);
    assert_eq!(result.texture_id, Some(id));
    assert_eq!(result.texture_set, Some(set));
    // Nothing was decoded or uploaded for an external texture.
    assert_eq!(gpu.upload_count(), 0);
    assert_eq!(mgr.cached_entry_count(), 0);
}

#[test]
fn removal_hands_the_set_back_and_forgets_the_url() {
    let loader = StubLoader::new();
    let gpu = RecordingGpu::new();
    let mut mgr = manager(&loader, &gpu);

    let set = external_set(5);
    let url = VisualUrl::new(mgr.add_external_texture(set.clone()));
    assert_eq!(mgr.remove_external_texture(&url), Some(set));
    assert_eq!(mgr.remove_external_texture(&url), None);

    let mut masking = None;
    let mut premultiply = MultiplyOnLoad::LoadWithoutMultiply;
    let result = mgr.load_texture(
        &url,
        ImageDimensions::default(),
        FittingMode::default(),
        SamplingMode::default(),
        &mut masking,
        false,
        None,
        true,
        ReloadPolicy::Cached,
        &mut premultiply,
    );
    assert!(result.texture_id.is_none());
    assert!(result.texture_set.is_none());
}

#[test]
fn external_ids_share_the_loaded_texture_id_space() {
    let loader = StubLoader::new();
    let gpu = RecordingGpu::new();
    loader.insert("photo.png", rgba(2, 2, [1, 2, 3, 255]));
    let mut mgr = manager(&loader, &gpu);

    let mut premultiply = MultiplyOnLoad::LoadWithoutMultiply;
    let loaded = mgr.request_load(
        &VisualUrl::new("photo.png"),
        ImageDimensions::default(),
        FittingMode::default(),
        SamplingMode::default(),
        UseAtlas::NoAtlas,
        None,
        true,
        ReloadPolicy::Cached,
        &mut premultiply,
    );
    let external = VisualUrl::new(mgr.add_external_texture(external_set(9)))
        .texture_id()
        .unwrap();
    assert_ne!(loaded, external);

    pump(&mut mgr, 1);
    // Both ids answer queries from their own side of the registry.
    assert_eq!(mgr.get_texture_state(loaded), LoadState::Uploaded);
    assert_eq!(mgr.get_texture_state(external), LoadState::Uploaded);
}
