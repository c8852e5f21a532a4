mod patch_pipeline;
